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

//! Multi-document reads with read skew detection.

mod manager;

use std::sync::Arc;

use compact_str::CompactString;
use hashbrown::HashSet;
use serde::de::DeserializeOwned;

pub use self::manager::{GetMultiManager, GetMultiPhase};
use crate::document::{AtrRef, CollectionRef, CompositeId, DocumentLookupResult, JsonTranscoder, Transcoder};
use crate::error::{Result, TxnError};

/// How hard a multi-document read tries to detect read skew.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GetMultiMode {
    DisableReadSkewDetection,
    /// Gives read skew resolution 100ms after the first fetch.
    #[default]
    PrioritizeLatency,
    /// Spends up to the attempt's expiration resolving read skew.
    PrioritizeReadSkewDetection,
}

/// Where documents are read from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum GetMultiSource {
    #[default]
    Primary,
    ReplicaFromPreferredServerGroup,
}

impl GetMultiSource {
    pub fn allow_replica(self) -> bool {
        self == Self::ReplicaFromPreferredServerGroup
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct GetMultiOptions {
    mode: Option<GetMultiMode>,
    source: GetMultiSource,
}

impl GetMultiOptions {
    pub fn with_mode(self, mode: GetMultiMode) -> Self {
        Self { mode: Some(mode), ..self }
    }

    pub fn with_source(self, source: GetMultiSource) -> Self {
        Self { source, ..self }
    }

    /// Mode to run in, `None` to follow the transaction config.
    pub fn mode(&self) -> Option<GetMultiMode> {
        self.mode
    }

    pub fn source(&self) -> GetMultiSource {
        self.source
    }
}

/// One document to read.
#[derive(Clone, Debug)]
pub struct GetMultiSpec {
    pub collection: CollectionRef,
    pub id: CompactString,
    pub transcoder: Option<Arc<dyn Transcoder>>,
}

impl GetMultiSpec {
    pub fn new(collection: CollectionRef, id: impl Into<CompactString>) -> Self {
        Self { collection, id: id.into(), transcoder: None }
    }

    pub fn with_transcoder(self, transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder: Some(transcoder), ..self }
    }
}

/// Outcome of one round of a multi-document read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Retry,
    Completed,
    BoundsExceeded,
    ResetAndRetry,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DocState {
    #[default]
    ToFetch,
    Fetched,
    /// Fetched without metadata although the committed ATR lists it, then fetched again.
    WereInT1,
}

#[derive(Clone, Debug, Default)]
pub struct SpecResult {
    pub document: Option<DocumentLookupResult>,
    pub state: DocState,
    pub signal: Option<Signal>,
}

/// Per spec results, in the order of the specs.
#[derive(Clone, Debug)]
pub struct GetMultiResult {
    source: GetMultiSource,
    results: Vec<SpecResult>,
    transcoders: Vec<Option<Arc<dyn Transcoder>>>,
    use_pre_commit: bool,
}

impl GetMultiResult {
    pub fn new(specs: &[GetMultiSpec], source: GetMultiSource) -> Self {
        Self {
            source,
            results: vec![SpecResult::default(); specs.len()],
            transcoders: specs.iter().map(|spec| spec.transcoder.clone()).collect(),
            use_pre_commit: true,
        }
    }

    pub fn source(&self) -> GetMultiSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.results.len() {
            return Err(TxnError::invalid_argument(format!("spec index {index} is out of range")));
        }
        Ok(())
    }

    fn fetched(&self, index: usize) -> Result<&SpecResult> {
        self.check_index(index)?;
        let result = &self.results[index];
        if result.state == DocState::ToFetch {
            return Err(TxnError::invalid_argument(format!("document {index} not fetched yet")));
        }
        Ok(result)
    }

    pub fn exists(&self, index: usize) -> Result<bool> {
        Ok(self.fetched(index)?.document.is_some())
    }

    /// Deserializes content of document at given index, `None` if there is no document.
    ///
    /// Documents carrying transactional metadata yield their staged content once the result
    /// switched to the post-commit view.
    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        let Some(document) = &self.fetched(index)?.document else {
            return Ok(None);
        };
        let content = match (&document.xattrs, self.use_pre_commit) {
            (Some(_), false) => document.post_transaction_content(),
            _ => document.pre_transaction_content(),
        };
        let Some(content) = content else {
            return Ok(None);
        };
        let value = match &self.transcoders[index] {
            Some(transcoder) => transcoder.decode(content)?,
            None => JsonTranscoder.decode(content)?,
        };
        Ok(Some(serde_json::from_value(value).map_err(anyhow::Error::from)?))
    }

    pub fn spec_result(&self, index: usize) -> Option<&SpecResult> {
        self.results.get(index)
    }

    pub fn is_pre_commit(&self) -> bool {
        self.use_pre_commit
    }

    pub(crate) fn use_post_commit(&mut self) {
        self.use_pre_commit = false;
    }

    pub(crate) fn use_pre_commit(&mut self) {
        self.use_pre_commit = true;
    }

    pub fn all_fetched(&self) -> bool {
        self.results.iter().all(|result| result.state != DocState::ToFetch)
    }

    pub(crate) fn should_fetch(&self, index: usize) -> bool {
        self.results[index].state == DocState::ToFetch
    }

    pub(crate) fn reset_results(&mut self) {
        self.use_pre_commit();
        self.results.iter_mut().for_each(|result| *result = SpecResult::default());
    }

    pub(crate) fn insert_result(&mut self, index: usize, document: Option<DocumentLookupResult>) {
        let result = &mut self.results[index];
        result.document = document;
        result.state = DocState::Fetched;
        result.signal = None;
    }

    pub(crate) fn insert_signal(&mut self, index: usize, signal: Signal) {
        self.results[index].signal = Some(signal);
    }

    pub(crate) fn set_state(&mut self, index: usize, state: DocState) {
        self.results[index].state = state;
    }

    pub(crate) fn first_signal(&self) -> Option<Signal> {
        self.results.iter().find_map(|result| result.signal)
    }

    /// Number of distinct transactions, other than the excluded one, that fetched documents are in.
    pub(crate) fn count_unique_transactions(&self, exclude: &str) -> usize {
        let mut transactions: HashSet<&str> = self
            .results
            .iter()
            .filter_map(|result| result.document.as_ref().and_then(|document| document.transaction_id()))
            .collect();
        transactions.remove(exclude);
        transactions.len()
    }

    pub(crate) fn first_atr_ref(&self, exclude: &str) -> Option<(AtrRef, CompositeId)> {
        self.results.iter().find_map(|result| {
            let xattrs = result.document.as_ref()?.xattrs.as_ref()?;
            match xattrs.transaction_id() == exclude {
                true => None,
                false => Some((xattrs.atr_ref.clone(), xattrs.id.clone())),
            }
        })
    }

    pub(crate) fn find_first_result(
        &self,
        predicate: impl Fn(Option<&DocumentLookupResult>) -> bool,
    ) -> Option<&DocumentLookupResult> {
        self.results.iter().map(|result| result.document.as_ref()).find(|document| predicate(*document)).flatten()
    }

    pub(crate) fn iterate_results(
        &self,
        predicate: impl Fn(Option<&DocumentLookupResult>) -> bool,
        mut action: impl FnMut(Option<&DocumentLookupResult>, usize),
    ) {
        for (index, result) in self.results.iter().enumerate() {
            let document = result.document.as_ref();
            if predicate(document) {
                action(document, index);
            }
        }
    }
}
