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

//! Active transaction record entries.
//!
//! Every attempt that stages a mutation owns one entry inside an ATR document. Any party that
//! meets the attempt's metadata on a document reads the entry back to learn whether the staged
//! change is committed.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use compact_str::CompactString;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::compat::CompatibilityBlob;
use crate::document::DocRecord;
use crate::error::{Result, TxnError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttemptState {
    NothingWritten,
    Pending,
    Committed,
    Completed,
    Aborted,
    RolledBack,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NothingWritten => "NOTHING_WRITTEN",
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    pub fn can_transit(self, to: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, to),
            (NothingWritten, Pending)
                | (NothingWritten, Aborted)
                | (Pending, Committed)
                | (Pending, Aborted)
                | (Committed, Completed)
                | (Aborted, RolledBack)
        )
    }

    pub fn transit(self, to: AttemptState) -> Result<AttemptState> {
        if !self.can_transit(to) {
            return Err(TxnError::IllegalStateTransition { from: self, to });
        }
        Ok(to)
    }
}

impl Display for AttemptState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = TxnError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "NOTHING_WRITTEN" => Self::NothingWritten,
            "PENDING" => Self::Pending,
            "COMMITTED" => Self::Committed,
            "COMPLETED" => Self::Completed,
            "ABORTED" => Self::Aborted,
            "ROLLED_BACK" => Self::RolledBack,
            _ => return Err(TxnError::invalid_argument(format!("unknown attempt state {s:?}"))),
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    #[serde(rename = "n")]
    None,
    #[serde(rename = "m")]
    Majority,
    #[serde(rename = "pa")]
    MajorityAndPersistToActive,
    #[serde(rename = "pm")]
    PersistToMajority,
}

/// Parses a `0x` prefixed mutation CAS macro expansion into wall clock time.
///
/// The 16 hex digits encode a little endian 64 bit nanosecond value, so byte order is reversed
/// regardless of host endianness.
pub fn parse_mutation_cas_field(value: &str) -> Result<Timestamp> {
    let error = |reason| TxnError::CasParse { value: value.to_string(), reason };
    let digits = value.strip_prefix("0x").ok_or_else(|| error("missing 0x prefix"))?;
    if digits.len() != 16 {
        return Err(error("expect 16 hex digits"));
    }
    let bytes = hex_simd::decode_to_vec(digits).map_err(|_| error("non hex character"))?;
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| error("expect 8 bytes"))?;
    let nanos = u64::from_le_bytes(bytes);
    Timestamp::from_millisecond((nanos / 1_000_000) as i64).map_err(|_| error("timestamp out of range"))
}

/// Same as [parse_mutation_cas_field] but yields `None` on malformed input.
pub fn parse_mutation_cas_field_opt(value: &str) -> Option<Timestamp> {
    parse_mutation_cas_field(value).ok()
}

/// Inverse of [parse_mutation_cas_field] at millisecond precision.
pub fn format_mutation_cas_field(timestamp: Timestamp) -> String {
    let nanos = (timestamp.as_millisecond().max(0) as u64).saturating_mul(1_000_000);
    format!("0x{:016x}", nanos.swap_bytes())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AtrEntryFields {
    #[serde(rename = "tid", default, skip_serializing_if = "Option::is_none")]
    transaction_id: Option<CompactString>,
    #[serde(rename = "st", default, skip_serializing_if = "Option::is_none")]
    state: Option<CompactString>,
    #[serde(rename = "tst", default, skip_serializing_if = "Option::is_none")]
    timestamp_start: Option<String>,
    #[serde(rename = "tsc", default, skip_serializing_if = "Option::is_none")]
    timestamp_commit: Option<String>,
    #[serde(rename = "tsco", default, skip_serializing_if = "Option::is_none")]
    timestamp_complete: Option<String>,
    #[serde(rename = "tsrs", default, skip_serializing_if = "Option::is_none")]
    timestamp_rollback_start: Option<String>,
    #[serde(rename = "tsrc", default, skip_serializing_if = "Option::is_none")]
    timestamp_rollback_complete: Option<String>,
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    expires_after_msecs: Option<u64>,
    #[serde(rename = "ins", default)]
    inserted: Vec<DocRecord>,
    #[serde(rename = "rep", default)]
    replaced: Vec<DocRecord>,
    #[serde(rename = "rem", default)]
    removed: Vec<DocRecord>,
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    forward_compatibility: Option<CompatibilityBlob>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    durability: Option<DurabilityLevel>,
}

/// Snapshot of one attempt's entry in an ATR document.
#[derive(Clone, Debug, PartialEq)]
pub struct AtrEntry {
    attempt_id: CompactString,
    transaction_id: Option<CompactString>,
    state: Option<AttemptState>,
    timestamp_start: Option<Timestamp>,
    timestamp_commit: Option<Timestamp>,
    timestamp_complete: Option<Timestamp>,
    timestamp_rollback_start: Option<Timestamp>,
    timestamp_rollback_complete: Option<Timestamp>,
    expires_after_msecs: Option<u64>,
    inserted: Vec<DocRecord>,
    replaced: Vec<DocRecord>,
    removed: Vec<DocRecord>,
    forward_compatibility: Option<CompatibilityBlob>,
    durability: Option<DurabilityLevel>,
}

impl AtrEntry {
    pub fn new(
        attempt_id: impl Into<CompactString>,
        transaction_id: impl Into<CompactString>,
        state: AttemptState,
    ) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            transaction_id: Some(transaction_id.into()),
            state: Some(state),
            timestamp_start: None,
            timestamp_commit: None,
            timestamp_complete: None,
            timestamp_rollback_start: None,
            timestamp_rollback_complete: None,
            expires_after_msecs: None,
            inserted: Vec::new(),
            replaced: Vec::new(),
            removed: Vec::new(),
            forward_compatibility: None,
            durability: None,
        }
    }

    pub fn with_start(self, timestamp_start: Timestamp, expires_after_msecs: u64) -> Self {
        Self { timestamp_start: Some(timestamp_start), expires_after_msecs: Some(expires_after_msecs), ..self }
    }

    pub fn with_doc_records(self, inserted: Vec<DocRecord>, replaced: Vec<DocRecord>, removed: Vec<DocRecord>) -> Self {
        Self { inserted, replaced, removed, ..self }
    }

    pub fn with_forward_compatibility(self, forward_compatibility: CompatibilityBlob) -> Self {
        Self { forward_compatibility: Some(forward_compatibility), ..self }
    }

    pub fn with_durability(self, durability: DurabilityLevel) -> Self {
        Self { durability: Some(durability), ..self }
    }

    /// Decodes the entry stored under `attempt_id` in an ATR's attempts object.
    ///
    /// Timestamps are advisory, so malformed ones decode as absent instead of failing.
    pub fn from_json(attempt_id: impl Into<CompactString>, value: &serde_json::Value) -> Result<Self> {
        let fields = AtrEntryFields::deserialize(value).map_err(|err| anyhow!("ATR could not be parsed: {err}"))?;
        let state = fields.state.as_deref().and_then(|state| state.parse().ok());
        if state.is_none() && fields.transaction_id.is_none() && fields.timestamp_start.is_none() {
            return Err(TxnError::Internal(anyhow!("ATR could not be parsed: no state")));
        }
        let parse = |field: &Option<String>| field.as_deref().and_then(parse_mutation_cas_field_opt);
        Ok(Self {
            attempt_id: attempt_id.into(),
            timestamp_start: parse(&fields.timestamp_start),
            timestamp_commit: parse(&fields.timestamp_commit),
            timestamp_complete: parse(&fields.timestamp_complete),
            timestamp_rollback_start: parse(&fields.timestamp_rollback_start),
            timestamp_rollback_complete: parse(&fields.timestamp_rollback_complete),
            transaction_id: fields.transaction_id,
            state,
            expires_after_msecs: fields.expires_after_msecs,
            inserted: fields.inserted,
            replaced: fields.replaced,
            removed: fields.removed,
            forward_compatibility: fields.forward_compatibility,
            durability: fields.durability,
        })
    }

    /// Encodes the entry in its stored shape with short field names.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let format = |timestamp: Option<Timestamp>| timestamp.map(format_mutation_cas_field);
        let fields = AtrEntryFields {
            transaction_id: self.transaction_id.clone(),
            state: self.state.map(|state| state.as_str().into()),
            timestamp_start: format(self.timestamp_start),
            timestamp_commit: format(self.timestamp_commit),
            timestamp_complete: format(self.timestamp_complete),
            timestamp_rollback_start: format(self.timestamp_rollback_start),
            timestamp_rollback_complete: format(self.timestamp_rollback_complete),
            expires_after_msecs: self.expires_after_msecs,
            inserted: self.inserted.clone(),
            replaced: self.replaced.clone(),
            removed: self.removed.clone(),
            forward_compatibility: self.forward_compatibility.clone(),
            durability: self.durability,
        };
        let value = serde_json::to_value(fields).map_err(|err| anyhow!("ATR entry could not be encoded: {err}"))?;
        Ok(value)
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn state(&self) -> Option<AttemptState> {
        self.state
    }

    pub fn timestamp_start(&self) -> Option<Timestamp> {
        self.timestamp_start
    }

    pub fn timestamp_commit(&self) -> Option<Timestamp> {
        self.timestamp_commit
    }

    pub fn timestamp_complete(&self) -> Option<Timestamp> {
        self.timestamp_complete
    }

    pub fn timestamp_rollback_start(&self) -> Option<Timestamp> {
        self.timestamp_rollback_start
    }

    pub fn timestamp_rollback_complete(&self) -> Option<Timestamp> {
        self.timestamp_rollback_complete
    }

    pub fn expires_after_msecs(&self) -> Option<u64> {
        self.expires_after_msecs
    }

    pub fn inserted_ids(&self) -> &[DocRecord] {
        &self.inserted
    }

    pub fn replaced_ids(&self) -> &[DocRecord] {
        &self.replaced
    }

    pub fn removed_ids(&self) -> &[DocRecord] {
        &self.removed
    }

    pub fn all_doc_records(&self) -> impl Iterator<Item = &DocRecord> {
        self.inserted.iter().chain(self.replaced.iter()).chain(self.removed.iter())
    }

    pub fn forward_compatibility(&self) -> Option<&CompatibilityBlob> {
        self.forward_compatibility.as_ref()
    }

    pub fn durability(&self) -> Option<DurabilityLevel> {
        self.durability
    }

    /// `None` if either start timestamp or expiry is unknown.
    pub fn is_expired(&self) -> Option<bool> {
        self.is_expired_at(clock::unix_millis_now())
    }

    fn is_expired_at(&self, now_millis: i64) -> Option<bool> {
        let start = self.timestamp_start?.as_millisecond();
        let expires_after = i64::try_from(self.expires_after_msecs?).unwrap_or(i64::MAX);
        Some(start.saturating_add(expires_after) < now_millis)
    }
}
