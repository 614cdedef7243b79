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

//! Arbitration between key-value and query phases of an attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scopeguard::defer;
use static_assertions::assert_impl_all;
use tracing::{debug, trace};

use crate::atr::AttemptState;
use crate::attempt::{AttemptContext, StateFlags};
use crate::error::{ErrorBuilder, ErrorClass, FinalError, Result, TxnError};
use crate::utils::Gate;

/// Guards operations of one attempt so that a mode switch, commit or rollback never races a live
/// operation.
///
/// New operations pass the start gate only while it is open. The start gate stays closed while
/// any blocker holds it. The drained gate is open exactly when no operation is in flight. Counter
/// updates and start gate flips happen under one lock, so once the start gate is observed closed
/// the in-flight count can only go down.
pub struct OperationWrapper {
    attempt: Arc<AttemptContext>,
    counters: spin::Mutex<Counters>,
    start_gate: Gate,
    drained: Gate,
    query_mode: AtomicBool,
    query_lock: tokio::sync::Mutex<()>,
}

assert_impl_all!(OperationWrapper: Send, Sync);

#[derive(Debug, Default)]
struct Counters {
    in_flight: usize,
    blockers: usize,
}

struct InFlight<'a> {
    wrapper: &'a OperationWrapper,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.wrapper.end_task();
    }
}

impl OperationWrapper {
    pub fn new(attempt: Arc<AttemptContext>) -> Self {
        Self {
            attempt,
            counters: spin::Mutex::new(Counters::default()),
            start_gate: Gate::new(true),
            drained: Gate::new(true),
            query_mode: AtomicBool::new(false),
            query_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn attempt(&self) -> &Arc<AttemptContext> {
        &self.attempt
    }

    pub fn in_flight(&self) -> usize {
        self.counters.lock().in_flight
    }

    pub fn is_query_mode(&self) -> bool {
        self.query_mode.load(Ordering::Relaxed)
    }

    pub fn set_query_mode(&self) {
        if !self.query_mode.swap(true, Ordering::Relaxed) {
            debug!("attempt {} switched to query mode", self.attempt.attempt_id());
        }
    }

    pub fn reset_query_mode(&self) {
        self.query_mode.store(false, Ordering::Relaxed);
    }

    /// Closes the start gate until every blocker unblocks. Operations already past it keep running.
    pub fn block_task_starting(&self) {
        let mut counters = self.counters.lock();
        counters.blockers += 1;
        self.start_gate.close();
        debug!("new operations blocked by {} blockers", counters.blockers);
    }

    /// Releases one blocker, opening the start gate once none is left.
    pub fn unblock_task_starting(&self) {
        let mut counters = self.counters.lock();
        counters.blockers = counters.blockers.saturating_sub(1);
        if counters.blockers == 0 {
            self.start_gate.open();
            debug!("new operations unblocked");
        }
    }

    pub async fn tasks_can_start(&self) {
        self.start_gate.wait().await;
    }

    pub async fn wait_for_task_completion(&self) {
        self.drained.wait().await;
    }

    fn increment(&self, counters: &mut Counters) -> InFlight<'_> {
        counters.in_flight += 1;
        if counters.in_flight == 1 {
            self.drained.close();
        }
        trace!("{} operations in flight", counters.in_flight);
        InFlight { wrapper: self }
    }

    /// Counts an operation in without passing the start gate.
    fn begin_task(&self) -> InFlight<'_> {
        let mut counters = self.counters.lock();
        self.increment(&mut counters)
    }

    fn end_task(&self) {
        let mut counters = self.counters.lock();
        counters.in_flight -= 1;
        trace!("{} operations in flight after end", counters.in_flight);
        if counters.in_flight == 0 {
            self.drained.open();
        }
    }

    async fn start_task(&self) -> Result<InFlight<'_>> {
        let task = loop {
            self.start_gate.wait().await;
            let mut counters = self.counters.lock();
            if counters.blockers != 0 {
                continue;
            }
            break self.increment(&mut counters);
        };
        self.check_attempt_state()?;
        Ok(task)
    }

    fn check_attempt_state(&self) -> Result<()> {
        let cause = match self.attempt.state() {
            AttemptState::Aborted | AttemptState::RolledBack => TxnError::AlreadyAborted,
            AttemptState::Committed | AttemptState::Completed => TxnError::AlreadyCommitted,
            AttemptState::NothingWritten | AttemptState::Pending
                if self.attempt.is_flag_set(StateFlags::COMMIT_NOT_ALLOWED) =>
            {
                TxnError::AlreadyCommitted
            },
            AttemptState::NothingWritten | AttemptState::Pending => return Ok(()),
        };
        Err(ErrorBuilder::new(&self.attempt, ErrorClass::FailOther)
            .cause(cause)
            .do_not_rollback_attempt()
            .raise(FinalError::TransactionFailed)
            .build())
    }

    /// Runs `kv_operation` or `query_operation` depending on current mode as one in-flight operation.
    pub async fn wrap_operation<T, K, KF, Q, QF>(&self, kv_operation: K, query_operation: Q) -> Result<T>
    where
        K: FnOnce() -> KF,
        KF: Future<Output = Result<T>>,
        Q: FnOnce() -> QF,
        QF: Future<Output = Result<T>>, {
        let _task = self.start_task().await?;
        match self.is_query_mode() {
            true => query_operation().await,
            false => kv_operation().await,
        }
    }

    /// Runs query operations one at a time.
    ///
    /// The first one drains in-flight key-value operations and keeps new operations out until it
    /// ends, giving it the chance to switch the attempt into query mode.
    pub async fn wrap_query_operation<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>, {
        let _query = self.query_lock.lock().await;
        if self.is_query_mode() {
            return operation().await;
        }
        self.block_task_starting();
        defer! {
            self.unblock_task_starting();
        }
        debug!("waiting for {} in-flight operations before query", self.in_flight());
        self.wait_for_task_completion().await;
        let _task = self.begin_task();
        operation().await
    }

    /// Drains in-flight operations, runs `operation` with new operations held back, then lets
    /// them in again.
    pub async fn wait_on_tasks_then_perform_under_lock<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>, {
        self.block_task_starting();
        defer! {
            self.unblock_task_starting();
        }
        self.wait_for_task_completion().await;
        operation().await
    }
}
