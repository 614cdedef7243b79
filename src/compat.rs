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

//! Forward compatibility guard.
//!
//! Attempts written by newer clients may attach rules to their metadata that tell older clients
//! how to behave when they meet it at a given interaction point: either fail fast or retry the
//! whole transaction, optionally after a delay.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attempt::AttemptContext;
use crate::error::{ErrorBuilder, ErrorClass, Result, TxnError};
use crate::timer::Timer;

pub const PROTOCOL_VERSION: (u32, u32) = (2, 0);

pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["TI", "MO", "BM", "QU", "SD", "BF3705", "BF3787", "BF3838", "BF3791", "CM", "SI", "QC", "IX", "TS", "PU", "RP"];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InteractionPoint {
    WriteWriteConflictReadingAtr,
    WriteWriteConflictReplacing,
    WriteWriteConflictRemoving,
    WriteWriteConflictInserting,
    WriteWriteConflictInsertingGet,
    Gets,
    GetsReadingAtr,
    GetMulti,
    CleanupEntry,
}

impl InteractionPoint {
    pub fn code(self) -> &'static str {
        match self {
            Self::WriteWriteConflictReadingAtr => "WW_R",
            Self::WriteWriteConflictReplacing => "WW_RP",
            Self::WriteWriteConflictRemoving => "WW_RM",
            Self::WriteWriteConflictInserting => "WW_I",
            Self::WriteWriteConflictInsertingGet => "WW_IG",
            Self::Gets => "G",
            Self::GetsReadingAtr => "G_A",
            Self::GetMulti => "GM",
            Self::CleanupEntry => "CL_E",
        }
    }
}

impl Display for InteractionPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    #[serde(rename = "f")]
    FailFast,
    #[serde(rename = "r")]
    Retry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<CompactString>,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<CompactString>,
    #[serde(rename = "b")]
    pub behavior: Behavior,
    #[serde(rename = "ra", default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl CompatibilityRule {
    fn is_supported(&self) -> bool {
        if let Some(protocol) = &self.protocol {
            if !parse_version(protocol).is_some_and(|version| version <= PROTOCOL_VERSION) {
                return false;
            }
        }
        if let Some(extension) = &self.extension {
            if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
                return false;
            }
        }
        true
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.').unwrap_or((version, "0"));
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Rules keyed by interaction point code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityBlob {
    rules: BTreeMap<CompactString, Vec<CompatibilityRule>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CompatibilityFailure {
    pub behavior: Behavior,
    pub retry_after: Option<Duration>,
}

impl CompatibilityBlob {
    pub fn with_rule(mut self, interaction: InteractionPoint, rule: CompatibilityRule) -> Self {
        self.rules.entry(interaction.code().into()).or_default().push(rule);
        self
    }

    /// First rule at given interaction point this client does not satisfy.
    pub fn evaluate(&self, interaction: InteractionPoint) -> Option<CompatibilityFailure> {
        let rules = self.rules.get(interaction.code())?;
        rules.iter().find(|rule| !rule.is_supported()).map(|rule| CompatibilityFailure {
            behavior: rule.behavior,
            retry_after: match rule.behavior {
                Behavior::Retry => rule.retry_after_ms.map(Duration::from_millis),
                Behavior::FailFast => None,
            },
        })
    }
}

#[async_trait]
pub trait CompatibilityChecker: Send + Sync + std::fmt::Debug + 'static {
    async fn check(
        &self,
        attempt: &AttemptContext,
        interaction: InteractionPoint,
        blob: Option<&CompatibilityBlob>,
    ) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardCompatibility;

#[async_trait]
impl CompatibilityChecker for ForwardCompatibility {
    async fn check(
        &self,
        attempt: &AttemptContext,
        interaction: InteractionPoint,
        blob: Option<&CompatibilityBlob>,
    ) -> Result<()> {
        let Some(failure) = blob.and_then(|blob| blob.evaluate(interaction)) else {
            return Ok(());
        };
        debug!("forward compatibility failure at {interaction}: {failure:?}");
        let cause = TxnError::ForwardCompatibility { interaction, retry_after: failure.retry_after };
        let builder = ErrorBuilder::new(attempt, ErrorClass::FailOther).cause(cause);
        match failure.behavior {
            Behavior::FailFast => Err(builder.build()),
            Behavior::Retry => {
                if let Some(delay) = failure.retry_after {
                    Timer::after(delay).await;
                }
                Err(builder.retry_transaction().build())
            },
        }
    }
}
