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

use bytes::Bytes;
use static_assertions::assert_impl_all;

use crate::document::{CollectionRef, DocRecord, FullyQualifiedId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StagedMutationType {
    Insert,
    Replace,
    Remove,
}

/// Write prepared by an attempt but not yet applied to the document itself.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedMutation {
    pub id: FullyQualifiedId,
    pub kind: StagedMutationType,
    /// Staged body, absent for removals.
    pub content: Option<Bytes>,
    /// CAS of the document after staging.
    pub cas: u64,
}

impl StagedMutation {
    pub fn insert(id: FullyQualifiedId, content: impl Into<Bytes>, cas: u64) -> Self {
        Self { id, kind: StagedMutationType::Insert, content: Some(content.into()), cas }
    }

    pub fn replace(id: FullyQualifiedId, content: impl Into<Bytes>, cas: u64) -> Self {
        Self { id, kind: StagedMutationType::Replace, content: Some(content.into()), cas }
    }

    pub fn remove(id: FullyQualifiedId, cas: u64) -> Self {
        Self { id, kind: StagedMutationType::Remove, content: None, cas }
    }
}

/// Staged mutations of one attempt keyed by fully qualified id.
///
/// Every accessor returns copies, so callers never iterate while another task stages.
#[derive(Debug, Default)]
pub struct StagedMutationCollection {
    mutations: spin::Mutex<Vec<StagedMutation>>,
}

assert_impl_all!(StagedMutationCollection: Send, Sync);

impl StagedMutationCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages given mutation, returning the one it supersedes for the same document.
    pub fn add(&self, mutation: StagedMutation) -> Option<StagedMutation> {
        let mut mutations = self.mutations.lock();
        match mutations.iter_mut().find(|staged| staged.id == mutation.id) {
            Some(staged) => Some(std::mem::replace(staged, mutation)),
            None => {
                mutations.push(mutation);
                None
            },
        }
    }

    pub fn remove(&self, id: &FullyQualifiedId) -> Option<StagedMutation> {
        let mut mutations = self.mutations.lock();
        let i = mutations.iter().position(|staged| staged.id == *id)?;
        Some(mutations.remove(i))
    }

    pub fn find(&self, collection: &CollectionRef, id: &str) -> Option<StagedMutation> {
        let mutations = self.mutations.lock();
        mutations.iter().find(|staged| staged.id.collection == *collection && staged.id.id == id).cloned()
    }

    pub fn contains(&self, collection: &CollectionRef, id: &str) -> bool {
        let mutations = self.mutations.lock();
        mutations.iter().any(|staged| staged.id.collection == *collection && staged.id.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.lock().len()
    }

    pub fn clear(&self) {
        self.mutations.lock().clear();
    }

    pub fn to_list(&self) -> Vec<StagedMutation> {
        self.mutations.lock().clone()
    }

    fn filtered(&self, kind: StagedMutationType) -> Vec<StagedMutation> {
        self.to_list().into_iter().filter(|staged| staged.kind == kind).collect()
    }

    pub fn inserts(&self) -> Vec<StagedMutation> {
        self.filtered(StagedMutationType::Insert)
    }

    pub fn replaces(&self) -> Vec<StagedMutation> {
        self.filtered(StagedMutationType::Replace)
    }

    pub fn removes(&self) -> Vec<StagedMutation> {
        self.filtered(StagedMutationType::Remove)
    }

    /// Inserted, replaced and removed documents in the shape recorded into the ATR entry.
    pub fn doc_records(&self) -> (Vec<DocRecord>, Vec<DocRecord>, Vec<DocRecord>) {
        let mut inserts = Vec::new();
        let mut replaces = Vec::new();
        let mut removes = Vec::new();
        for staged in self.to_list() {
            let records = match staged.kind {
                StagedMutationType::Insert => &mut inserts,
                StagedMutationType::Replace => &mut replaces,
                StagedMutationType::Remove => &mut removes,
            };
            records.push(DocRecord::from(&staged.id));
        }
        (inserts, replaces, removes)
    }
}
