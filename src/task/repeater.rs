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
use std::time::Duration;

use tracing::trace;

use crate::config::TransactionConfig;
use crate::error::{Result, TxnError};
use crate::timer::{Backoff, Timer};

const BACKOFF_INITIAL: Duration = Duration::from_millis(1);
const BACKOFF_MAX: Duration = Duration::from_millis(100);

/// What to do after one round of a repeated operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RepeatAction {
    NoRepeat,
    /// Sleeps the configured fixed delay.
    RepeatWithDelay,
    RepeatNoDelay,
    /// Sleeps a doubling delay from 1ms capped at 100ms.
    RepeatWithBackoff,
}

#[derive(Clone, Debug)]
pub struct TaskRepeater {
    delay: Duration,
    retry_limit: usize,
}

impl TaskRepeater {
    pub fn new(config: &TransactionConfig) -> Self {
        Self { delay: config.repeat_delay(), retry_limit: config.retry_limit() }
    }

    pub fn with_retry_limit(self, retry_limit: usize) -> Self {
        Self { retry_limit, ..self }
    }

    #[inline]
    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }

    /// Calls `f` until it asks for no repeat, returning the value of that round.
    ///
    /// Errors from `f` propagate immediately. Fails with [TxnError::RetryLimitExceeded] naming
    /// `operation` once repeats exceed the retry limit.
    pub async fn repeat_until_success_or_throw<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(RepeatAction, T)>>, {
        let mut backoff = Backoff::capped(BACKOFF_INITIAL, BACKOFF_MAX);
        let mut repeats = 0;
        loop {
            let (action, value) = f().await?;
            match action {
                RepeatAction::NoRepeat => return Ok(value),
                _ if repeats >= self.retry_limit => {
                    return Err(TxnError::RetryLimitExceeded { operation: operation.into(), limit: self.retry_limit })
                },
                RepeatAction::RepeatNoDelay => {},
                RepeatAction::RepeatWithDelay => {
                    Timer::after(self.delay).await;
                },
                RepeatAction::RepeatWithBackoff => backoff.wait().await,
            }
            repeats += 1;
            trace!("repeating {operation} after {action:?}, round {repeats}");
        }
    }
}
