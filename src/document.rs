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

//! Document addressing and the transactional metadata attached to fetched documents.

use std::fmt::{self, Debug, Display, Formatter};

use anyhow::Result;
use bytes::Bytes;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::compat::CompatibilityBlob;
use crate::staged::StagedMutationType;

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

/// Bucket, scope and collection triple.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionRef {
    pub bucket: CompactString,
    pub scope: CompactString,
    pub collection: CompactString,
}

impl CollectionRef {
    pub fn new(
        bucket: impl Into<CompactString>,
        scope: impl Into<CompactString>,
        collection: impl Into<CompactString>,
    ) -> Self {
        Self { bucket: bucket.into(), scope: scope.into(), collection: collection.into() }
    }

    pub fn default_collection(bucket: impl Into<CompactString>) -> Self {
        Self::new(bucket, DEFAULT_SCOPE, DEFAULT_COLLECTION)
    }

    pub fn doc(&self, id: impl Into<CompactString>) -> FullyQualifiedId {
        FullyQualifiedId { collection: self.clone(), id: id.into() }
    }
}

impl Display for CollectionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

impl Debug for CollectionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Collection plus document id, the identity of a document across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullyQualifiedId {
    pub collection: CollectionRef,
    pub id: CompactString,
}

impl FullyQualifiedId {
    pub fn new(collection: CollectionRef, id: impl Into<CompactString>) -> Self {
        Self { collection, id: id.into() }
    }
}

impl Display for FullyQualifiedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Document reference as recorded in an ATR entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRecord {
    #[serde(rename = "bkt")]
    pub bucket: CompactString,
    #[serde(rename = "scp", default = "default_scope")]
    pub scope: CompactString,
    #[serde(rename = "col", default = "default_collection")]
    pub collection: CompactString,
    pub id: CompactString,
}

fn default_scope() -> CompactString {
    DEFAULT_SCOPE.into()
}

fn default_collection() -> CompactString {
    DEFAULT_COLLECTION.into()
}

impl DocRecord {
    pub fn fully_qualified_id(&self) -> FullyQualifiedId {
        CollectionRef::new(self.bucket.clone(), self.scope.clone(), self.collection.clone()).doc(self.id.clone())
    }
}

impl From<&FullyQualifiedId> for DocRecord {
    fn from(id: &FullyQualifiedId) -> Self {
        Self {
            bucket: id.collection.bucket.clone(),
            scope: id.collection.scope.clone(),
            collection: id.collection.collection.clone(),
            id: id.id.clone(),
        }
    }
}

/// Location of the ATR document that holds an attempt's entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AtrRef {
    pub bucket: Option<CompactString>,
    pub scope: Option<CompactString>,
    pub collection: Option<CompactString>,
    pub id: CompactString,
}

impl AtrRef {
    pub fn new(collection: &CollectionRef, id: impl Into<CompactString>) -> Self {
        Self {
            bucket: Some(collection.bucket.clone()),
            scope: Some(collection.scope.clone()),
            collection: Some(collection.collection.clone()),
            id: id.into(),
        }
    }

    /// Resolves the collection holding this ATR, reusing `any` when it is the same one.
    pub fn resolve(&self, any: &CollectionRef) -> Option<CollectionRef> {
        let (Some(bucket), Some(collection)) = (&self.bucket, &self.collection) else {
            return None;
        };
        let scope = self.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
        if any.bucket == *bucket && any.scope == scope && any.collection == *collection {
            return Some(any.clone());
        }
        Some(CollectionRef::new(bucket.clone(), scope, collection.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompositeId {
    pub transaction_id: CompactString,
    pub attempt_id: CompactString,
}

/// Transactional metadata staged on a document by some attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionXattrs {
    pub id: CompositeId,
    pub atr_ref: AtrRef,
    pub operation: Option<StagedMutationType>,
    /// Content the owning attempt will write on commit.
    pub staged_content: Option<Bytes>,
    pub forward_compatibility: Option<CompatibilityBlob>,
}

impl TransactionXattrs {
    pub fn transaction_id(&self) -> &str {
        &self.id.transaction_id
    }
}

/// Outcome of a document lookup that understands transactional metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentLookupResult {
    pub id: FullyQualifiedId,
    pub cas: u64,
    /// Committed body, absent for documents only staged for insertion.
    pub content: Option<Bytes>,
    pub xattrs: Option<TransactionXattrs>,
}

impl DocumentLookupResult {
    pub fn new(id: FullyQualifiedId, cas: u64, content: impl Into<Bytes>) -> Self {
        Self { id, cas, content: Some(content.into()), xattrs: None }
    }

    pub fn with_xattrs(self, xattrs: TransactionXattrs) -> Self {
        Self { xattrs: Some(xattrs), ..self }
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.xattrs.as_ref().map(|xattrs| xattrs.transaction_id())
    }

    /// Whether this document carries metadata staged by a transaction other than the given one.
    pub fn is_in_other_transaction(&self, transaction_id: &str) -> bool {
        self.transaction_id().is_some_and(|id| id != transaction_id)
    }

    pub fn pre_transaction_content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn post_transaction_content(&self) -> Option<&Bytes> {
        match &self.xattrs {
            None => self.content.as_ref(),
            Some(xattrs) => match xattrs.operation {
                Some(StagedMutationType::Remove) => None,
                _ => xattrs.staged_content.as_ref(),
            },
        }
    }
}

/// Decodes raw document bodies.
pub trait Transcoder: Send + Sync + Debug {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    fn xattrs(transaction_id: &str, operation: StagedMutationType, staged: Option<&'static str>) -> TransactionXattrs {
        let atr_collection = CollectionRef::default_collection("default");
        TransactionXattrs {
            id: CompositeId { transaction_id: transaction_id.into(), attempt_id: "a1".into() },
            atr_ref: AtrRef::new(&atr_collection, "_txn:atr-1"),
            operation: Some(operation),
            staged_content: staged.map(|s| Bytes::from_static(s.as_bytes())),
            forward_compatibility: None,
        }
    }

    #[test]
    fn atr_ref_resolve() {
        let collection = CollectionRef::default_collection("default");
        let atr_ref = AtrRef::new(&collection, "atr-1");
        assert_that!(atr_ref.resolve(&collection)).is_equal_to(Some(collection.clone()));

        let other = CollectionRef::new("default", "inventory", "hotels");
        let resolved = atr_ref.resolve(&other).unwrap();
        assert_that!(resolved).is_equal_to(collection.clone());

        let unresolvable = AtrRef { bucket: None, ..atr_ref };
        assert_that!(unresolvable.resolve(&collection)).is_equal_to(None);
    }

    #[test]
    fn lookup_result_views() {
        let id = CollectionRef::default_collection("default").doc("doc-1");
        let plain = DocumentLookupResult::new(id.clone(), 1, &b"{\"v\":1}"[..]);
        assert_that!(plain.post_transaction_content()).is_equal_to(plain.pre_transaction_content());
        assert_that!(plain.is_in_other_transaction("t0")).is_false();

        let replaced = plain.clone().with_xattrs(xattrs("t1", StagedMutationType::Replace, Some("{\"v\":2}")));
        assert_that!(&replaced.pre_transaction_content().unwrap()[..]).is_equal_to(&b"{\"v\":1}"[..]);
        assert_that!(&replaced.post_transaction_content().unwrap()[..]).is_equal_to(&b"{\"v\":2}"[..]);
        assert_that!(replaced.is_in_other_transaction("t0")).is_true();
        assert_that!(replaced.is_in_other_transaction("t1")).is_false();

        let removed = plain.with_xattrs(xattrs("t1", StagedMutationType::Remove, None));
        assert_that!(removed.post_transaction_content()).is_equal_to(None);
    }

    #[test]
    fn doc_record_round_trip_id() {
        let id = CollectionRef::new("travel", "inventory", "hotels").doc("hotel-1");
        let record = DocRecord::from(&id);
        assert_that!(record.fully_qualified_id()).is_equal_to(id);
    }
}
