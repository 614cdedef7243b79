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
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use compact_str::{CompactString, ToCompactString};
use static_assertions::assert_impl_all;
use tracing::{debug, info};
use uuid::Uuid;

use crate::atr::AttemptState;
use crate::clock::Deadline;
use crate::config::TransactionConfig;
use crate::error::{ErrorBuilder, ErrorClass, FinalError, Result, TxnError};
use crate::staged::{StagedMutation, StagedMutationCollection};
use crate::task::TaskLimiter;

/// Behavior restrictions an attempt accumulates once it starts ending.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const NONE: StateFlags = StateFlags(0);
    pub const COMMIT_NOT_ALLOWED: StateFlags = StateFlags(1);
    pub const APP_ROLLBACK_NOT_ALLOWED: StateFlags = StateFlags(1 << 1);

    pub fn contains(self, other: StateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One try of a transaction.
pub struct AttemptContext {
    transaction_id: CompactString,
    attempt_id: CompactString,
    state: spin::Mutex<AttemptState>,
    flags: AtomicU8,
    expiry_overtime: AtomicBool,
    expiration: Deadline,
    staged: StagedMutationCollection,
    config: TransactionConfig,
}

assert_impl_all!(AttemptContext: Send, Sync);

impl AttemptContext {
    pub fn new(config: &TransactionConfig) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_compact_string(),
            attempt_id: Uuid::new_v4().to_compact_string(),
            state: spin::Mutex::new(AttemptState::NothingWritten),
            flags: AtomicU8::new(StateFlags::NONE.0),
            expiry_overtime: AtomicBool::new(false),
            expiration: Deadline::after(config.expiration()),
            staged: StagedMutationCollection::new(),
            config: config.clone(),
        }
    }

    pub fn with_ids(self, transaction_id: impl Into<CompactString>, attempt_id: impl Into<CompactString>) -> Self {
        Self { transaction_id: transaction_id.into(), attempt_id: attempt_id.into(), ..self }
    }

    #[inline]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    #[inline]
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    #[inline]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// Moves attempt to given state, refusing edges the attempt state machine does not have.
    pub fn set_state(&self, to: AttemptState) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.transit(to)?;
        debug!("attempt {} transited to {to}", self.attempt_id);
        Ok(())
    }

    pub fn state_flags(&self) -> StateFlags {
        StateFlags(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: StateFlags) {
        self.flags.fetch_or(flags.0, Ordering::AcqRel);
    }

    pub fn is_flag_set(&self, flags: StateFlags) -> bool {
        self.state_flags().contains(flags)
    }

    #[inline]
    pub fn expiration(&self) -> Deadline {
        self.expiration
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.is_expired()
    }

    pub fn is_expiry_overtime(&self) -> bool {
        self.expiry_overtime.load(Ordering::Acquire)
    }

    /// Fails with an attempt ending expiry error if the attempt has expired.
    ///
    /// Entering this failure switches the attempt into expiry overtime mode, in which only the
    /// work needed to end the attempt proceeds.
    pub fn check_expiry(&self, stage: &str) -> Result<()> {
        if !self.is_expired() {
            return Ok(());
        }
        info!("attempt {} expired in {stage}", self.attempt_id);
        self.expiry_overtime.store(true, Ordering::Release);
        Err(ErrorBuilder::new(self, ErrorClass::FailExpiry)
            .cause(TxnError::AttemptExpired { stage: stage.into() })
            .raise(FinalError::TransactionExpired)
            .build())
    }

    /// Expiry check for steps that keep going once the attempt is in expiry overtime mode.
    pub fn error_if_expired_and_not_in_overtime(&self, stage: &str) -> Result<()> {
        if self.is_expiry_overtime() {
            debug!("attempt {} skips expiry check in {stage} during overtime", self.attempt_id);
            return Ok(());
        }
        if self.is_expired() {
            return Err(TxnError::AttemptExpired { stage: stage.into() });
        }
        Ok(())
    }

    #[inline]
    pub fn staged_mutations(&self) -> &StagedMutationCollection {
        &self.staged
    }

    /// Runs `handler` over a snapshot of staged mutations with bounded concurrency.
    pub async fn for_each_staged<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(StagedMutation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static, {
        let limiter = TaskLimiter::new(self.config.unstaging_concurrency());
        let handler = Arc::new(handler);
        for staged in self.staged.to_list() {
            let handler = handler.clone();
            limiter.run(staged, move |staged| (*handler)(staged));
        }
        limiter.wait_all().await
    }
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("transaction_id", &self.transaction_id)
            .field("attempt_id", &self.attempt_id)
            .field("state", &self.state())
            .field("flags", &self.state_flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use assertor::*;

    use super::*;
    use crate::document::CollectionRef;

    #[test]
    fn ids_unique() {
        let config = TransactionConfig::default();
        let attempt1 = AttemptContext::new(&config);
        let attempt2 = AttemptContext::new(&config);
        assert_that!(attempt1.transaction_id()).is_not_equal_to(attempt2.transaction_id());
        assert_that!(attempt1.attempt_id()).is_not_equal_to(attempt1.transaction_id());

        let attempt = attempt1.with_ids("t1", "a1");
        assert_that!(attempt.transaction_id()).is_equal_to("t1");
        assert_that!(attempt.attempt_id()).is_equal_to("a1");
    }

    #[test]
    fn state_transitions() {
        let attempt = AttemptContext::new(&TransactionConfig::default());
        assert_that!(attempt.state()).is_equal_to(AttemptState::NothingWritten);
        attempt.set_state(AttemptState::Pending).unwrap();
        attempt.set_state(AttemptState::Committed).unwrap();
        let err = attempt.set_state(AttemptState::Aborted).unwrap_err();
        assert!(matches!(err, TxnError::IllegalStateTransition { .. }));
        assert_that!(attempt.state()).is_equal_to(AttemptState::Committed);
    }

    #[test]
    fn state_flags() {
        let attempt = AttemptContext::new(&TransactionConfig::default());
        assert_that!(attempt.is_flag_set(StateFlags::COMMIT_NOT_ALLOWED)).is_false();
        attempt.set_flags(StateFlags::COMMIT_NOT_ALLOWED | StateFlags::APP_ROLLBACK_NOT_ALLOWED);
        assert_that!(attempt.is_flag_set(StateFlags::COMMIT_NOT_ALLOWED)).is_true();
        assert_that!(attempt.is_flag_set(StateFlags::APP_ROLLBACK_NOT_ALLOWED)).is_true();
    }

    #[tokio::test]
    async fn expiry_enters_overtime() {
        let attempt = AttemptContext::new(&TransactionConfig::default().with_expiration(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        attempt.error_if_expired_and_not_in_overtime("atr-pending").unwrap_err();

        let err = attempt.check_expiry("get").unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailExpiry);
        assert_that!(failed.to_raise).is_equal_to(FinalError::TransactionExpired);
        assert_that!(attempt.is_expiry_overtime()).is_true();

        attempt.error_if_expired_and_not_in_overtime("atr-commit").unwrap();
    }

    #[test]
    fn not_expired() {
        let attempt = AttemptContext::new(&TransactionConfig::default());
        attempt.check_expiry("get").unwrap();
        assert_that!(attempt.is_expiry_overtime()).is_false();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn for_each_staged_visits_all() {
        let config = TransactionConfig::default().with_unstaging_concurrency(3);
        let attempt = AttemptContext::new(&config);
        let collection = CollectionRef::default_collection("default");
        for i in 0..10 {
            attempt.staged_mutations().add(StagedMutation::remove(collection.doc(format!("doc-{i}")), i));
        }
        let visited = Arc::new(AtomicUsize::new(0));
        let counter = visited.clone();
        attempt
            .for_each_staged(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_that!(visited.load(Ordering::SeqCst)).is_equal_to(10);
    }
}
