// Copyright 2023 The SeamDB Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use static_assertions::assert_impl_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Result, TxnError};

/// Runs spawned handlers with at most a fixed number executing at any moment.
///
/// Handlers are scheduled without blocking the caller. [TaskLimiter::wait_all] waits for the
/// handlers scheduled before it, later ones form the next generation.
#[derive(Debug)]
pub struct TaskLimiter {
    semaphore: Arc<Semaphore>,
    tasks: spin::Mutex<Vec<JoinHandle<Result<()>>>>,
}

assert_impl_all!(TaskLimiter: Send, Sync);

impl TaskLimiter {
    pub fn new(concurrency: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(concurrency.max(1))), tasks: Default::default() }
    }

    pub fn run<T, F, Fut>(&self, item: T, handler: F)
    where
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static, {
        let semaphore = self.semaphore.clone();
        let task = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|err| anyhow!(err))?;
            handler(item).await
        });
        self.tasks.lock().push(task);
    }

    /// Same as [TaskLimiter::run] but hands the handler's output to `collect` along with `index`.
    ///
    /// Concurrent handlers call `collect` in parallel, so it must tolerate that, typically by
    /// writing only to its own index.
    pub fn run_with_result<T, R, F, Fut, C>(&self, item: T, index: usize, handler: F, collect: C)
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        C: FnOnce(R, usize) + Send + 'static, {
        self.run(item, move |item| async move {
            let result = handler(item).await?;
            collect(result, index);
            Ok(())
        })
    }

    /// Number of scheduled handlers not yet waited for.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Waits for every handler scheduled so far, returning the first failure after all completed.
    pub async fn wait_all(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        trace!("waiting for {} tasks", tasks.len());
        let mut first_error = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(err) => Err(TxnError::Internal(anyhow!("task failed: {err}"))),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
