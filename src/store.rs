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

//! Collaborators backed by the document store.

use std::sync::Arc;

use async_trait::async_trait;

use crate::atr::AtrEntry;
use crate::clock::Deadline;
use crate::compat::{CompatibilityChecker, ForwardCompatibility};
use crate::document::{AtrRef, CollectionRef, DocumentLookupResult, Transcoder};
use crate::error::StoreError;

/// Reads documents together with their transactional metadata.
#[async_trait]
pub trait DocumentLookup: Send + Sync + std::fmt::Debug + 'static {
    /// Fails with [StoreError::DocumentNotFound] or [StoreError::DocumentUnretrievable] for
    /// documents that can not be read, [StoreError::Timeout] once `deadline` passes.
    async fn lookup(
        &self,
        collection: &CollectionRef,
        id: &str,
        deadline: Deadline,
        transcoder: Option<&dyn Transcoder>,
        allow_replica: bool,
    ) -> Result<DocumentLookupResult, StoreError>;
}

/// Reads entries of active transaction records.
#[async_trait]
pub trait AtrReader: Send + Sync + std::fmt::Debug + 'static {
    /// Collection holding the referenced ATR, `None` if the reference can not be resolved.
    fn atr_collection(&self, atr_ref: &AtrRef, any: &CollectionRef) -> Option<CollectionRef> {
        atr_ref.resolve(any)
    }

    /// Entry of given attempt, `None` if the ATR or the entry is gone.
    async fn find_entry(
        &self,
        atr_collection: &CollectionRef,
        atr_id: &str,
        attempt_id: &str,
    ) -> Result<Option<AtrEntry>, StoreError>;
}

/// Store collaborators an attempt reads through.
#[derive(Clone, Debug)]
pub struct Stores {
    pub documents: Arc<dyn DocumentLookup>,
    pub atrs: Arc<dyn AtrReader>,
    pub compatibility: Arc<dyn CompatibilityChecker>,
}

impl Stores {
    pub fn new(documents: Arc<dyn DocumentLookup>, atrs: Arc<dyn AtrReader>) -> Self {
        Self { documents, atrs, compatibility: Arc::new(ForwardCompatibility) }
    }

    pub fn with_compatibility(self, compatibility: Arc<dyn CompatibilityChecker>) -> Self {
        Self { compatibility, ..self }
    }
}
