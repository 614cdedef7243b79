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

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, debug_span, instrument, warn, Instrument};

use super::{DocState, GetMultiMode, GetMultiOptions, GetMultiResult, GetMultiSpec, Signal};
use crate::atr::AttemptState;
use crate::attempt::AttemptContext;
use crate::clock::Deadline;
use crate::compat::{CompatibilityChecker, InteractionPoint};
use crate::document::FullyQualifiedId;
use crate::error::{ErrorBuilder, ErrorClass, Result, StoreError, TxnError};
use crate::store::{AtrReader, DocumentLookup, Stores};
use crate::task::{RepeatAction, TaskLimiter, TaskRepeater};
use crate::timer::Backoff;

const LATENCY_BUDGET: Duration = Duration::from_millis(100);
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GetMultiPhase {
    FirstDocFetch,
    SubsequentToFirstDocFetch,
    /// Documents listed by the committed ATR entry were found without metadata and refetched.
    DiscoveredDocsInT1,
    /// The ATR entry of the other transaction was missing once already.
    ResolvingT1AtrEntryMissing,
}

/// Per document fetching shared with spawned fetch tasks.
#[derive(Debug)]
struct Fetcher {
    attempt: Arc<AttemptContext>,
    documents: Arc<dyn DocumentLookup>,
    compatibility: Arc<dyn CompatibilityChecker>,
    repeater: TaskRepeater,
    mode: GetMultiMode,
    allow_replica: bool,
    result: spin::Mutex<GetMultiResult>,
}

impl Fetcher {
    async fn fetch_document(&self, spec: &GetMultiSpec, deadline: Deadline, index: usize) -> Result<()> {
        self.repeater
            .repeat_until_success_or_throw("get_multi_fetch_document", || self.try_fetch_document(spec, deadline, index))
            .await
    }

    async fn try_fetch_document(
        &self,
        spec: &GetMultiSpec,
        deadline: Deadline,
        index: usize,
    ) -> Result<(RepeatAction, ())> {
        self.attempt.check_expiry("get_multi_fetch_document")?;
        debug!("fetching document {}/{}, allow_replica={}", spec.collection, spec.id, self.allow_replica);
        let lookup = self
            .documents
            .lookup(&spec.collection, &spec.id, deadline, spec.transcoder.as_deref(), self.allow_replica)
            .await;
        let err = match lookup {
            Ok(document) => {
                if let Some(xattrs) = &document.xattrs {
                    let blob = xattrs.forward_compatibility.as_ref();
                    self.compatibility.check(&self.attempt, InteractionPoint::GetMulti, blob).await?;
                    self.compatibility.check(&self.attempt, InteractionPoint::Gets, blob).await?;
                }
                self.result.lock().insert_result(index, Some(document));
                return Ok((RepeatAction::NoRepeat, ()));
            },
            Err(err) => err,
        };
        match err {
            StoreError::DocumentNotFound | StoreError::DocumentUnretrievable => {
                debug!("document {}/{} not found: {err}", spec.collection, spec.id);
                self.result.lock().insert_result(index, None);
                Ok((RepeatAction::NoRepeat, ()))
            },
            StoreError::Timeout if self.mode == GetMultiMode::PrioritizeReadSkewDetection => {
                debug!("document {}/{} timed out, retrying", spec.collection, spec.id);
                Ok((RepeatAction::RepeatWithBackoff, ()))
            },
            StoreError::Timeout => {
                debug!("document {}/{} timed out, signaling bounds exceeded", spec.collection, spec.id);
                self.result.lock().insert_signal(index, Signal::BoundsExceeded);
                Ok((RepeatAction::NoRepeat, ()))
            },
            err => {
                let class = err.classify();
                debug!("document {}/{} failed with {class:?}: {err}", spec.collection, spec.id);
                if class == ErrorClass::FailTransient {
                    return Ok((RepeatAction::RepeatWithBackoff, ()));
                }
                let builder = ErrorBuilder::new(&self.attempt, class).cause(err);
                match class {
                    ErrorClass::FailHard => Err(builder.do_not_rollback_attempt().build()),
                    _ => Err(builder.build()),
                }
            },
        }
    }
}

/// Fetches a fixed list of documents for one attempt, resolving read skew against at most one
/// other transaction.
#[derive(Debug)]
pub struct GetMultiManager {
    fetcher: Arc<Fetcher>,
    atrs: Arc<dyn AtrReader>,
    specs: Vec<GetMultiSpec>,
    limiter: TaskLimiter,
    kv_timeout: Duration,
    deadline: Deadline,
    phase: GetMultiPhase,
}

impl GetMultiManager {
    pub fn new(attempt: Arc<AttemptContext>, stores: Stores, specs: Vec<GetMultiSpec>, options: GetMultiOptions) -> Self {
        let config = attempt.config();
        let kv_timeout = config.kv_timeout();
        let limiter = TaskLimiter::new(config.get_multi_concurrency());
        let repeater = TaskRepeater::new(config);
        let mode = options.mode().unwrap_or_else(|| config.get_multi_mode());
        let result = GetMultiResult::new(&specs, options.source());
        let fetcher = Fetcher {
            attempt,
            documents: stores.documents,
            compatibility: stores.compatibility,
            repeater,
            mode,
            allow_replica: options.source().allow_replica(),
            result: spin::Mutex::new(result),
        };
        Self {
            fetcher: Arc::new(fetcher),
            atrs: stores.atrs,
            specs,
            limiter,
            kv_timeout,
            deadline: Deadline::after(kv_timeout),
            phase: GetMultiPhase::FirstDocFetch,
        }
    }

    pub fn phase(&self) -> GetMultiPhase {
        self.phase
    }

    pub fn mode(&self) -> GetMultiMode {
        self.fetcher.mode
    }

    fn attempt(&self) -> &AttemptContext {
        &self.fetcher.attempt
    }

    fn result(&self) -> GetMultiResult {
        self.fetcher.result.lock().clone()
    }

    /// Fetches all documents, returning once no read skew is detected or it is resolved.
    ///
    /// Rounds are separated by a doubling delay that only the attempt's expiration bounds.
    #[instrument(skip_all, fields(attempt.id = %self.attempt().attempt_id(), specs = self.specs.len()))]
    pub async fn run(&mut self) -> Result<GetMultiResult> {
        let mut backoff = Backoff::unbounded(INITIAL_RETRY_DELAY);
        loop {
            self.attempt().check_expiry("get_multi")?;
            let span = debug_span!("round", phase = ?self.phase, deadline_remaining = ?self.deadline.remaining());
            let signal = self.fetch_documents().instrument(span).await?;
            debug!("round ended with {signal:?} in phase {:?}", self.phase);
            match signal {
                Signal::Continue | Signal::Completed => return Ok(self.result()),
                Signal::ResetAndRetry => {
                    if self.phase != GetMultiPhase::FirstDocFetch {
                        self.phase = GetMultiPhase::SubsequentToFirstDocFetch;
                    }
                    self.fetcher.result.lock().reset_results();
                },
                Signal::BoundsExceeded => {
                    let result = self.result();
                    if result.all_fetched() {
                        return Ok(result);
                    }
                    warn!("bounds exceeded with documents left to fetch");
                    return Err(ErrorBuilder::new(self.attempt(), ErrorClass::FailOther)
                        .cause(anyhow!("get multi exceeded its bounds before fetching all documents"))
                        .retry_transaction()
                        .build());
                },
                Signal::Retry => {},
            }
            backoff.wait().await;
        }
    }

    fn spawn_fetch(&self, index: usize, deadline: Deadline) {
        let fetcher = self.fetcher.clone();
        let spec = self.specs[index].clone();
        self.limiter.run(spec, move |spec| async move { fetcher.fetch_document(&spec, deadline, index).await });
    }

    async fn fetch_documents(&mut self) -> Result<Signal> {
        let indices: Vec<usize> = {
            let result = self.fetcher.result.lock();
            (0..self.specs.len()).filter(|index| result.should_fetch(*index)).collect()
        };
        for index in indices {
            self.spawn_fetch(index, self.deadline);
        }
        self.limiter.wait_all().await?;

        if let Some(signal) = self.fetcher.result.lock().first_signal() {
            return Ok(signal);
        }

        match self.fetcher.mode {
            GetMultiMode::DisableReadSkewDetection => {},
            GetMultiMode::PrioritizeLatency => self.deadline = Deadline::after(LATENCY_BUDGET),
            GetMultiMode::PrioritizeReadSkewDetection => self.deadline = self.attempt().expiration(),
        }
        if self.phase == GetMultiPhase::FirstDocFetch {
            self.phase = GetMultiPhase::SubsequentToFirstDocFetch;
        }
        self.disambiguate().await
    }

    /// Refetches given documents, or documents in other transactions if none given.
    async fn refetch_documents(&self, indices: Option<Vec<usize>>) -> Result<()> {
        let indices = indices.unwrap_or_else(|| {
            let transaction_id = self.attempt().transaction_id();
            let mut indices = Vec::new();
            self.fetcher.result.lock().iterate_results(
                |document| document.is_some_and(|document| document.is_in_other_transaction(transaction_id)),
                |_, index| indices.push(index),
            );
            indices
        });
        debug!("refetching documents {indices:?}");
        for index in indices {
            let deadline = self.deadline.min(Deadline::after(self.kv_timeout));
            self.spawn_fetch(index, deadline);
        }
        self.limiter.wait_all().await
    }

    async fn disambiguate(&mut self) -> Result<Signal> {
        let transactions = self.fetcher.result.lock().count_unique_transactions(self.attempt().transaction_id());
        match transactions {
            0 => Ok(Signal::Continue),
            1 => self.read_skew_resolution().await,
            _ => Ok(Signal::ResetAndRetry),
        }
    }

    async fn read_skew_resolution(&mut self) -> Result<Signal> {
        match self.resolve_read_skew().await {
            Ok(signal) => Ok(signal),
            Err(err) if err.is_operation_failed() => Err(err),
            Err(TxnError::Store(StoreError::Timeout)) => match self.fetcher.mode {
                GetMultiMode::PrioritizeReadSkewDetection => Ok(Signal::Retry),
                _ => Ok(Signal::BoundsExceeded),
            },
            Err(err) => {
                let class = err.classify();
                warn!("read skew resolution failed with {class:?}: {err}");
                Err(ErrorBuilder::new(self.attempt(), class).cause(err).retry_transaction().build())
            },
        }
    }

    async fn resolve_read_skew(&mut self) -> Result<Signal> {
        let transaction_id = self.attempt().transaction_id();
        let first = self.fetcher.result.lock().first_atr_ref(transaction_id);
        let Some((atr_ref, id)) = first else {
            return Err(TxnError::invalid_argument("no ATR of other transaction found"));
        };
        if id.attempt_id.is_empty() {
            return Err(TxnError::invalid_argument("attempt identifier is invalid"));
        }
        let atr_collection = self
            .atrs
            .atr_collection(&atr_ref, &self.specs[0].collection)
            .ok_or_else(|| TxnError::invalid_argument(format!("can not resolve collection of ATR {}", atr_ref.id)))?;
        debug!("resolving read skew with ATR {atr_collection}/{} of attempt {}", atr_ref.id, id.attempt_id);
        let Some(entry) = self.atrs.find_entry(&atr_collection, &atr_ref.id, &id.attempt_id).await? else {
            return self.resolve_missing_atr_entry().await;
        };

        self.fetcher
            .compatibility
            .check(self.attempt(), InteractionPoint::GetsReadingAtr, entry.forward_compatibility())
            .await?;

        match entry.state() {
            Some(AttemptState::Aborted | AttemptState::Pending) => Ok(Signal::Completed),
            Some(AttemptState::Committed) if self.phase == GetMultiPhase::DiscoveredDocsInT1 => {
                debug!("ATR entry committed after refetching, switching to post-commit view");
                self.fetcher.result.lock().use_post_commit();
                Ok(Signal::Completed)
            },
            Some(AttemptState::Committed) => {
                let records: Vec<FullyQualifiedId> =
                    entry.all_doc_records().map(|record| record.fully_qualified_id()).collect();
                let mut indices = Vec::new();
                self.fetcher.result.lock().iterate_results(
                    |document| document.is_some_and(|document| document.xattrs.is_none() && records.contains(&document.id)),
                    |_, index| indices.push(index),
                );
                if indices.is_empty() {
                    self.fetcher.result.lock().use_post_commit();
                    return Ok(Signal::Completed);
                }
                debug!("documents {indices:?} are in committed transaction but fetched without metadata");
                self.refetch_documents(Some(indices.clone())).await?;
                self.phase = GetMultiPhase::DiscoveredDocsInT1;
                let mut result = self.fetcher.result.lock();
                for index in indices {
                    result.set_state(index, DocState::WereInT1);
                }
                Ok(Signal::Retry)
            },
            state => {
                warn!("unexpected ATR entry state {state:?}");
                Ok(Signal::ResetAndRetry)
            },
        }
    }

    /// The other transaction either committed or expired before its entry got cleaned up.
    async fn resolve_missing_atr_entry(&mut self) -> Result<Signal> {
        if self.phase == GetMultiPhase::ResolvingT1AtrEntryMissing {
            let transaction_id = self.attempt().transaction_id();
            let in_other = self
                .fetcher
                .result
                .lock()
                .find_first_result(|document| {
                    document.is_some_and(|document| document.is_in_other_transaction(transaction_id))
                })
                .is_some();
            return Ok(if in_other { Signal::Completed } else { Signal::ResetAndRetry });
        }
        debug!("ATR entry missing, refetching documents in other transaction");
        self.refetch_documents(None).await?;
        self.phase = GetMultiPhase::ResolvingT1AtrEntryMissing;
        Ok(Signal::Retry)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use test_case::test_case;

    use super::*;
    use crate::atr::AtrEntry;
    use crate::compat::{Behavior, CompatibilityBlob, CompatibilityRule};
    use crate::config::TransactionConfig;
    use crate::document::{AtrRef, CollectionRef, CompositeId, DocRecord, DocumentLookupResult, TransactionXattrs};
    use crate::error::FinalError;
    use crate::getmulti::GetMultiSource;
    use crate::memory::{MemoryStore, Response};
    use crate::staged::StagedMutationType;

    const ATR_ID: &str = "_txn:atr-42";

    fn collection() -> CollectionRef {
        CollectionRef::default_collection("travel")
    }

    fn doc_id(i: usize) -> FullyQualifiedId {
        collection().doc(format!("hotel-{i}"))
    }

    fn content(version: u32) -> String {
        json!({ "version": version }).to_string()
    }

    fn plain(i: usize, version: u32) -> DocumentLookupResult {
        DocumentLookupResult::new(doc_id(i), 1, content(version))
    }

    fn staged_by(i: usize, transaction_id: &str) -> DocumentLookupResult {
        plain(i, 1).with_xattrs(TransactionXattrs {
            id: CompositeId { transaction_id: transaction_id.into(), attempt_id: attempt_of(transaction_id).into() },
            atr_ref: AtrRef::new(&collection(), ATR_ID),
            operation: Some(StagedMutationType::Replace),
            staged_content: Some(Bytes::from(content(2))),
            forward_compatibility: None,
        })
    }

    fn attempt_of(transaction_id: &str) -> String {
        format!("{transaction_id}-attempt")
    }

    fn atr_entry(transaction_id: &str, state: AttemptState, replaced: &[usize]) -> AtrEntry {
        let replaced = replaced.iter().map(|i| DocRecord::from(&doc_id(*i))).collect();
        AtrEntry::new(attempt_of(transaction_id), transaction_id, state).with_doc_records(vec![], replaced, vec![])
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        attempt: Arc<AttemptContext>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(TransactionConfig::default())
        }

        fn with_config(config: TransactionConfig) -> Self {
            Self { store: Arc::new(MemoryStore::new()), attempt: Arc::new(AttemptContext::new(&config)) }
        }

        fn manager(&self, n: usize, options: GetMultiOptions) -> GetMultiManager {
            let specs = (0..n).map(|i| GetMultiSpec::new(collection(), format!("hotel-{i}"))).collect();
            let stores = Stores::new(self.store.clone(), self.store.clone());
            GetMultiManager::new(self.attempt.clone(), stores, specs, options)
        }

        fn lookups(&self, n: usize) -> Vec<usize> {
            (0..n).map(|i| self.store.lookup_count(&doc_id(i))).collect()
        }
    }

    fn version(result: &GetMultiResult, i: usize) -> Option<u64> {
        result.content_as::<Value>(i).unwrap().map(|value| value["version"].as_u64().unwrap())
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn no_transactional_documents() {
        let fixture = Fixture::new();
        for i in 0..5 {
            fixture.store.put(plain(i, 1));
        }
        let mut manager = fixture.manager(5, GetMultiOptions::default());
        let result = manager.run().await.unwrap();

        assert_that!(result.len()).is_equal_to(5);
        for i in 0..5 {
            assert_that!(result.exists(i).unwrap()).is_true();
            assert_that!(version(&result, i)).is_equal_to(Some(1));
        }
        assert_that!(fixture.lookups(5)).is_equal_to(vec![1; 5]);
        assert_that!(fixture.store.atr_reads()).is_equal_to(0);
        assert_that!(manager.phase()).is_equal_to(GetMultiPhase::SubsequentToFirstDocFetch);
    }

    #[tokio::test]
    async fn missing_documents_are_empty_slots() {
        let fixture = Fixture::new();
        fixture.store.put(plain(0, 1));
        fixture.store.script(doc_id(1), vec![Response::Unretrievable]);
        let result = fixture.manager(3, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.exists(0).unwrap()).is_true();
        assert_that!(result.exists(1).unwrap()).is_false();
        assert_that!(result.exists(2).unwrap()).is_false();
        assert_that!(result.content_as::<Value>(2).unwrap()).is_equal_to(None);
        assert_that!(result.exists(3).is_err()).is_true();
    }

    #[tokio::test]
    async fn own_transaction_is_not_skew() {
        let fixture = Fixture::new();
        let own = fixture.attempt.transaction_id().to_string();
        fixture.store.put(staged_by(0, &own));
        fixture.store.put(plain(1, 1));
        let result = fixture.manager(2, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.is_pre_commit()).is_true();
        assert_that!(fixture.store.atr_reads()).is_equal_to(0);
    }

    #[test_case(AttemptState::Pending)]
    #[test_case(AttemptState::Aborted)]
    #[tokio::test]
    async fn not_committed_uses_pre_commit_view(state: AttemptState) {
        let fixture = Fixture::new();
        for i in 0..5 {
            match i {
                1 | 3 => fixture.store.put(staged_by(i, "t1")),
                _ => fixture.store.put(plain(i, 1)),
            }
        }
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", state, &[1, 3])).unwrap();

        let result = fixture.manager(5, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.is_pre_commit()).is_true();
        for i in 0..5 {
            assert_that!(version(&result, i)).is_equal_to(Some(1));
        }
        assert_that!(fixture.lookups(5)).is_equal_to(vec![1; 5]);
        assert_that!(fixture.store.atr_reads()).is_equal_to(1);
    }

    #[test_log::test(tokio::test)]
    #[tracing_test::traced_test]
    async fn committed_refetches_documents_fetched_ahead_of_commit() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put(staged_by(1, "t1"));
        // Already unstaged by the time it got fetched.
        fixture.store.put(plain(2, 2));
        fixture.store.put(plain(3, 1));
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", AttemptState::Committed, &[0, 1, 2])).unwrap();

        let mut manager = fixture.manager(4, GetMultiOptions::default());
        let result = manager.run().await.unwrap();

        assert_that!(fixture.lookups(4)).is_equal_to(vec![1, 1, 2, 1]);
        assert_that!(manager.phase()).is_equal_to(GetMultiPhase::DiscoveredDocsInT1);
        assert_that!(result.is_pre_commit()).is_false();
        assert_that!(result.spec_result(2).unwrap().state).is_equal_to(DocState::WereInT1);
        assert_that!(version(&result, 0)).is_equal_to(Some(2));
        assert_that!(version(&result, 1)).is_equal_to(Some(2));
        assert_that!(version(&result, 2)).is_equal_to(Some(2));
        assert_that!(version(&result, 3)).is_equal_to(Some(1));
        assert_that!(fixture.store.atr_reads()).is_equal_to(2);
    }

    #[tokio::test]
    async fn committed_without_skew_uses_post_commit_view() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put(plain(1, 1));
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", AttemptState::Committed, &[0])).unwrap();

        let result = fixture.manager(2, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.is_pre_commit()).is_false();
        assert_that!(version(&result, 0)).is_equal_to(Some(2));
        assert_that!(version(&result, 1)).is_equal_to(Some(1));
        assert_that!(fixture.lookups(2)).is_equal_to(vec![1, 1]);
    }

    #[tokio::test]
    async fn multiple_transactions_reset_and_retry() {
        let fixture = Fixture::new();
        for i in 0..4 {
            let transaction_id = if i % 2 == 0 { "t1" } else { "t2" };
            fixture.store.script(doc_id(i), vec![Response::Found(staged_by(i, transaction_id)), Response::Found(plain(i, 2))]);
        }

        let mut manager = fixture.manager(4, GetMultiOptions::default());
        let result = manager.run().await.unwrap();
        assert_that!(fixture.lookups(4)).is_equal_to(vec![2; 4]);
        assert_that!(fixture.store.atr_reads()).is_equal_to(0);
        assert_that!(version(&result, 0)).is_equal_to(Some(2));
        assert_that!(manager.phase()).is_equal_to(GetMultiPhase::SubsequentToFirstDocFetch);
    }

    #[tokio::test]
    async fn missing_atr_entry_with_documents_unstaged() {
        let fixture = Fixture::new();
        fixture.store.script(doc_id(0), vec![Response::Found(staged_by(0, "t1")), Response::Found(plain(0, 2))]);
        fixture.store.put(plain(1, 1));

        let mut manager = fixture.manager(2, GetMultiOptions::default());
        let result = manager.run().await.unwrap();
        assert_that!(fixture.lookups(2)).is_equal_to(vec![2, 1]);
        assert_that!(fixture.store.atr_reads()).is_equal_to(1);
        assert_that!(version(&result, 0)).is_equal_to(Some(2));
        assert_that!(manager.phase()).is_equal_to(GetMultiPhase::ResolvingT1AtrEntryMissing);
    }

    #[tokio::test]
    async fn missing_atr_entry_twice_completes() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put(plain(1, 1));

        let result = fixture.manager(2, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(fixture.lookups(2)).is_equal_to(vec![2, 1]);
        assert_that!(fixture.store.atr_reads()).is_equal_to(2);
        assert_that!(result.is_pre_commit()).is_true();
        assert_that!(version(&result, 0)).is_equal_to(Some(1));
    }

    /// Deadlines of the first fetch and of the refetch after the ATR entry was found missing.
    async fn refetch_deadlines(mode: GetMultiMode) -> (Fixture, Deadline, Deadline) {
        let config = TransactionConfig::default()
            .with_expiration(Duration::from_secs(10))
            .with_kv_timeout(Duration::from_secs(60));
        let fixture = Fixture::with_config(config);
        fixture.store.put(staged_by(0, "t1"));

        let options = GetMultiOptions::default().with_mode(mode);
        fixture.manager(1, options).run().await.unwrap();
        let deadlines = fixture.store.lookup_deadlines(&doc_id(0));
        assert_that!(deadlines.len()).is_equal_to(2);
        (fixture, deadlines[0], deadlines[1])
    }

    #[tokio::test]
    async fn disabled_detection_keeps_kv_deadline() {
        let (_fixture, first, refetch) = refetch_deadlines(GetMultiMode::DisableReadSkewDetection).await;
        assert_that!(refetch).is_equal_to(first);
        assert_that!(refetch.remaining()).is_greater_than(Duration::from_secs(50));
    }

    #[tokio::test]
    async fn prioritized_latency_shrinks_deadline() {
        let (_fixture, first, refetch) = refetch_deadlines(GetMultiMode::PrioritizeLatency).await;
        assert_that!(refetch).is_less_than(first);
        assert_that!(refetch.remaining()).is_at_most(LATENCY_BUDGET);
        assert_that!(first.remaining()).is_greater_than(Duration::from_secs(50));
    }

    #[tokio::test]
    async fn prioritized_read_skew_detection_extends_to_expiration() {
        let (fixture, first, refetch) = refetch_deadlines(GetMultiMode::PrioritizeReadSkewDetection).await;
        assert_that!(refetch).is_equal_to(fixture.attempt.expiration());
        assert_that!(refetch).is_less_than(first);
    }

    #[tokio::test]
    async fn document_timeout_exceeds_bounds() {
        let fixture = Fixture::new();
        fixture.store.put(plain(0, 1));
        fixture.store.script(doc_id(1), vec![Response::Timeout]);

        let err = fixture.manager(2, GetMultiOptions::default()).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailOther);
        assert_that!(failed.retry_transaction).is_true();
        assert_that!(fixture.lookups(2)).is_equal_to(vec![1, 1]);
    }

    #[tokio::test]
    async fn document_timeout_retried_prioritizing_read_skew_detection() {
        let fixture = Fixture::new();
        fixture.store.script(doc_id(0), vec![Response::Timeout, Response::Timeout, Response::Found(plain(0, 1))]);

        let options = GetMultiOptions::default().with_mode(GetMultiMode::PrioritizeReadSkewDetection);
        let result = fixture.manager(1, options).run().await.unwrap();
        assert_that!(result.exists(0).unwrap()).is_true();
        assert_that!(fixture.lookups(1)).is_equal_to(vec![3]);
    }

    #[tokio::test]
    async fn atr_timeout_with_all_fetched_returns_result() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", AttemptState::Pending, &[0])).unwrap();
        fixture.store.fail_atr_reads([Response::Timeout]);

        let result = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.exists(0).unwrap()).is_true();
        assert_that!(fixture.store.atr_reads()).is_equal_to(1);
    }

    #[tokio::test]
    async fn atr_timeout_retried_prioritizing_read_skew_detection() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", AttemptState::Committed, &[0])).unwrap();
        fixture.store.fail_atr_reads([Response::Timeout, Response::Timeout]);

        let options = GetMultiOptions::default().with_mode(GetMultiMode::PrioritizeReadSkewDetection);
        let result = fixture.manager(1, options).run().await.unwrap();
        assert_that!(fixture.store.atr_reads()).is_equal_to(3);
        assert_that!(result.is_pre_commit()).is_false();
    }

    #[tokio::test]
    async fn atr_hard_failure_retries_transaction() {
        let fixture = Fixture::new();
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.fail_atr_reads([Response::Hard]);

        let err = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailHard);
        assert_that!(failed.retry_transaction).is_true();
    }

    #[tokio::test]
    async fn transient_failure_retried() {
        let fixture = Fixture::new();
        fixture.store.script(doc_id(0), vec![Response::Transient, Response::Found(plain(0, 1))]);
        let result = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.exists(0).unwrap()).is_true();
        assert_that!(fixture.lookups(1)).is_equal_to(vec![2]);
    }

    #[tokio::test]
    async fn hard_failure_ends_attempt_without_rollback() {
        let fixture = Fixture::new();
        fixture.store.script(doc_id(0), vec![Response::Hard]);
        let err = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailHard);
        assert_that!(failed.rollback_attempt).is_false();
        assert_that!(failed.retry_transaction).is_false();
    }

    #[tokio::test]
    async fn expired_attempt_fails_fast() {
        let fixture = Fixture::with_config(TransactionConfig::default().with_expiration(Duration::from_millis(1)));
        fixture.store.put(plain(0, 1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailExpiry);
        assert_that!(failed.to_raise).is_equal_to(FinalError::TransactionExpired);
        assert_that!(fixture.lookups(1)).is_equal_to(vec![0]);
    }

    #[tokio::test]
    async fn unexpected_atr_state_bounded_by_expiry_only() {
        let config = TransactionConfig::default().with_expiration(Duration::from_millis(300));
        let fixture = Fixture::with_config(config);
        fixture.store.put(staged_by(0, "t1"));
        fixture.store.put_atr_entry(&collection(), ATR_ID, &atr_entry("t1", AttemptState::Completed, &[0])).unwrap();

        let options = GetMultiOptions::default().with_mode(GetMultiMode::PrioritizeReadSkewDetection);
        let err = fixture.manager(1, options).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.class).is_equal_to(ErrorClass::FailExpiry);
        assert_that!(fixture.store.atr_reads()).is_greater_than(1);
        assert_that!(fixture.lookups(1)[0]).is_at_least(fixture.store.atr_reads());
    }

    #[tokio::test]
    async fn replica_source_allows_replica() {
        let fixture = Fixture::new();
        for i in 0..3 {
            fixture.store.put(plain(i, 1));
        }
        let options = GetMultiOptions::default().with_source(GetMultiSource::ReplicaFromPreferredServerGroup);
        let result = fixture.manager(3, options).run().await.unwrap();
        assert_that!(result.source()).is_equal_to(GetMultiSource::ReplicaFromPreferredServerGroup);
        assert_that!(fixture.store.replica_lookups()).is_equal_to(3);

        fixture.manager(3, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(fixture.store.replica_lookups()).is_equal_to(3);
    }

    #[tokio::test]
    async fn forward_compatibility_failure() {
        let fixture = Fixture::new();
        let mut document = staged_by(0, "t1");
        let rule = CompatibilityRule {
            protocol: None,
            extension: Some("NEWER".into()),
            behavior: Behavior::FailFast,
            retry_after_ms: None,
        };
        if let Some(xattrs) = document.xattrs.as_mut() {
            xattrs.forward_compatibility = Some(CompatibilityBlob::default().with_rule(InteractionPoint::GetMulti, rule));
        }
        fixture.store.put(document);

        let err = fixture.manager(1, GetMultiOptions::default()).run().await.unwrap_err();
        let failed = err.operation_failed().unwrap();
        assert!(matches!(failed.cause.as_ref(), TxnError::ForwardCompatibility { .. }));
        assert_that!(fixture.store.atr_reads()).is_equal_to(0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_documents_bounded_concurrency() {
        let fixture = Fixture::with_config(TransactionConfig::default().with_get_multi_concurrency(8));
        for i in 0..250 {
            fixture.store.put(plain(i, 1));
        }
        let result = fixture.manager(250, GetMultiOptions::default()).run().await.unwrap();
        assert_that!(result.all_fetched()).is_true();
        assert_that!(fixture.store.total_lookups()).is_equal_to(250);
    }
}
