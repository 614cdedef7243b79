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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use compact_str::CompactString;
use hashbrown::HashMap;
use serde_json::json;

use crate::atr::AtrEntry;
use crate::clock::Deadline;
use crate::document::{CollectionRef, DocumentLookupResult, FullyQualifiedId, Transcoder};
use crate::error::{StoreError, TxnError};
use crate::store::{AtrReader, DocumentLookup};

/// Scripted outcome of one store read.
#[derive(Clone, Debug)]
pub enum Response<T> {
    Found(T),
    NotFound,
    Unretrievable,
    Timeout,
    Transient,
    Hard,
}

impl<T> Response<T> {
    fn into_result(self) -> Result<T, StoreError> {
        match self {
            Self::Found(value) => Ok(value),
            Self::NotFound => Err(StoreError::DocumentNotFound),
            Self::Unretrievable => Err(StoreError::DocumentUnretrievable),
            Self::Timeout => Err(StoreError::Timeout),
            Self::Transient => Err(StoreError::transient("scripted transient failure")),
            Self::Hard => Err(StoreError::hard("scripted hard failure")),
        }
    }
}

/// Queue of responses whose last one repeats forever.
#[derive(Debug, Default)]
struct Script<T> {
    responses: VecDeque<Response<T>>,
}

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<Response<T>> {
        match self.responses.len() {
            0 => None,
            1 => self.responses.front().cloned(),
            _ => self.responses.pop_front(),
        }
    }
}

type AtrKey = (CollectionRef, CompactString);

/// In-memory document store with call instrumentation.
///
/// ATR documents are kept in their stored JSON shape and decoded on every read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: spin::Mutex<HashMap<FullyQualifiedId, Script<DocumentLookupResult>>>,
    /// Deadline of every lookup, per document.
    lookups: spin::Mutex<HashMap<FullyQualifiedId, Vec<Deadline>>>,
    replica_lookups: AtomicUsize,
    atrs: spin::Mutex<HashMap<AtrKey, serde_json::Value>>,
    atr_failures: spin::Mutex<VecDeque<Response<()>>>,
    atr_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the script of given document with a single response.
    pub fn put(&self, document: DocumentLookupResult) {
        let id = document.id.clone();
        self.script(id, vec![Response::Found(document)]);
    }

    /// Scripts successive lookups of given document, the last response answers all later ones.
    pub fn script(&self, id: FullyQualifiedId, responses: Vec<Response<DocumentLookupResult>>) {
        self.documents.lock().insert(id, Script { responses: responses.into() });
    }

    pub fn put_atr_entry(&self, collection: &CollectionRef, atr_id: &str, entry: &AtrEntry) -> Result<(), TxnError> {
        let value = entry.to_json()?;
        let mut atrs = self.atrs.lock();
        let atr = atrs.entry((collection.clone(), atr_id.into())).or_insert_with(|| json!({ "attempts": {} }));
        atr["attempts"][entry.attempt_id()] = value;
        Ok(())
    }

    pub fn remove_atr_entry(&self, collection: &CollectionRef, atr_id: &str, attempt_id: &str) {
        let key: AtrKey = (collection.clone(), atr_id.into());
        let mut atrs = self.atrs.lock();
        if let Some(attempts) = atrs.get_mut(&key).and_then(|atr| atr["attempts"].as_object_mut()) {
            attempts.remove(attempt_id);
        }
    }

    /// Fails upcoming ATR reads in order before serving stored entries again.
    pub fn fail_atr_reads(&self, failures: impl IntoIterator<Item = Response<()>>) {
        self.atr_failures.lock().extend(failures);
    }

    pub fn lookup_count(&self, id: &FullyQualifiedId) -> usize {
        self.lookups.lock().get(id).map_or(0, |deadlines| deadlines.len())
    }

    /// Deadlines given document was looked up with, in lookup order.
    pub fn lookup_deadlines(&self, id: &FullyQualifiedId) -> Vec<Deadline> {
        self.lookups.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn total_lookups(&self) -> usize {
        self.lookups.lock().values().map(|deadlines| deadlines.len()).sum()
    }

    pub fn replica_lookups(&self) -> usize {
        self.replica_lookups.load(Ordering::Relaxed)
    }

    pub fn atr_reads(&self) -> usize {
        self.atr_reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentLookup for MemoryStore {
    async fn lookup(
        &self,
        collection: &CollectionRef,
        id: &str,
        deadline: Deadline,
        transcoder: Option<&dyn Transcoder>,
        allow_replica: bool,
    ) -> Result<DocumentLookupResult, StoreError> {
        let id = collection.doc(id);
        self.lookups.lock().entry(id.clone()).or_default().push(deadline);
        if allow_replica {
            self.replica_lookups.fetch_add(1, Ordering::Relaxed);
        }
        if deadline.is_expired() {
            return Err(StoreError::Timeout);
        }
        let response = self.documents.lock().get_mut(&id).and_then(|script| script.next());
        let document = response.unwrap_or(Response::NotFound).into_result()?;
        if let (Some(transcoder), Some(content)) = (transcoder, &document.content) {
            transcoder.decode(content)?;
        }
        Ok(document)
    }
}

#[async_trait]
impl AtrReader for MemoryStore {
    async fn find_entry(
        &self,
        atr_collection: &CollectionRef,
        atr_id: &str,
        attempt_id: &str,
    ) -> Result<Option<AtrEntry>, StoreError> {
        self.atr_reads.fetch_add(1, Ordering::Relaxed);
        if let Some(failure) = self.atr_failures.lock().pop_front() {
            failure.into_result()?;
        }
        let key: AtrKey = (atr_collection.clone(), atr_id.into());
        let atrs = self.atrs.lock();
        let Some(entry) = atrs.get(&key).and_then(|atr| atr["attempts"].get(attempt_id)) else {
            return Ok(None);
        };
        let entry = AtrEntry::from_json(attempt_id, entry).map_err(anyhow::Error::from)?;
        Ok(Some(entry))
    }
}
