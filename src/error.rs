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

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use compact_str::CompactString;
use thiserror::Error;

use crate::atr::AttemptState;
use crate::attempt::AttemptContext;
use crate::compat::InteractionPoint;

/// Failures reported by document store collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document unretrievable")]
    DocumentUnretrievable,
    #[error("document already exists")]
    DocumentExists,
    #[error("path not found")]
    PathNotFound,
    #[error("path already exists")]
    PathExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("operation timed out")]
    Timeout,
    #[error("ambiguous outcome: {message}")]
    Ambiguous { message: String },
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("hard failure: {message}")]
    Hard { message: String },
    #[error("out of space")]
    OutOfSpace,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    pub fn hard(message: impl Into<String>) -> Self {
        Self::Hard { message: message.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::DocumentNotFound | Self::DocumentUnretrievable => ErrorClass::FailDocNotFound,
            Self::DocumentExists => ErrorClass::FailDocAlreadyExists,
            Self::PathNotFound => ErrorClass::FailPathNotFound,
            Self::PathExists => ErrorClass::FailPathAlreadyExists,
            Self::CasMismatch => ErrorClass::FailCasMismatch,
            Self::Timeout | Self::Transient { .. } => ErrorClass::FailTransient,
            Self::Ambiguous { .. } => ErrorClass::FailAmbiguous,
            Self::Hard { .. } => ErrorClass::FailHard,
            Self::OutOfSpace => ErrorClass::FailOutOfSpace,
            Self::Internal(_) => ErrorClass::FailOther,
        }
    }
}

/// Coarse classification of failures that drives retry and rollback decisions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    FailDocNotFound,
    FailDocAlreadyExists,
    FailPathNotFound,
    FailPathAlreadyExists,
    FailWriteWriteConflict,
    FailCasMismatch,
    FailTransient,
    FailAmbiguous,
    FailHard,
    FailOther,
    FailExpiry,
    FailOutOfSpace,
}

/// Error the transaction layer should surface once the attempt ends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FinalError {
    #[default]
    TransactionFailed,
    TransactionExpired,
    TransactionCommitAmbiguous,
    TransactionFailedPostCommit,
}

/// Attempt ending failure.
///
/// Carries enough for the transaction layer to decide whether to roll back the attempt and
/// whether to retry the whole transaction.
#[derive(Debug, Clone)]
pub struct TransactionOperationFailed {
    pub transaction_id: CompactString,
    pub attempt_id: CompactString,
    pub class: ErrorClass,
    pub retry_transaction: bool,
    pub rollback_attempt: bool,
    pub to_raise: FinalError,
    pub cause: Arc<TxnError>,
}

impl Display for TransactionOperationFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} attempt {} failed with {:?} (retry={}, rollback={}): {}",
            self.transaction_id, self.attempt_id, self.class, self.retry_transaction, self.rollback_attempt, self.cause
        )
    }
}

impl std::error::Error for TransactionOperationFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum TxnError {
    #[error(transparent)]
    OperationFailed(#[from] TransactionOperationFailed),
    #[error("transaction already aborted")]
    AlreadyAborted,
    #[error("transaction already committed")]
    AlreadyCommitted,
    #[error("attempt expired in {stage}")]
    AttemptExpired { stage: CompactString },
    #[error("{operation} exceeded retry limit {limit}")]
    RetryLimitExceeded { operation: CompactString, limit: usize },
    #[error("could not parse CAS {value:?}: {reason}")]
    CasParse { value: String, reason: &'static str },
    #[error("forward compatibility failure at {interaction}")]
    ForwardCompatibility { interaction: InteractionPoint, retry_after: Option<std::time::Duration> },
    #[error("illegal attempt state transition from {from} to {to}")]
    IllegalStateTransition { from: AttemptState, to: AttemptState },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TxnError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn is_operation_failed(&self) -> bool {
        matches!(self, Self::OperationFailed(_))
    }

    pub fn operation_failed(&self) -> Option<&TransactionOperationFailed> {
        match self {
            Self::OperationFailed(err) => Some(err),
            _ => None,
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::OperationFailed(err) => err.class,
            Self::AttemptExpired { .. } => ErrorClass::FailExpiry,
            Self::Store(err) => err.classify(),
            _ => ErrorClass::FailOther,
        }
    }
}

pub type Result<T, E = TxnError> = std::result::Result<T, E>;

/// Builds [TransactionOperationFailed] stamped with the attempt's identifiers.
pub struct ErrorBuilder {
    transaction_id: CompactString,
    attempt_id: CompactString,
    class: ErrorClass,
    retry_transaction: bool,
    rollback_attempt: bool,
    to_raise: FinalError,
    cause: Option<TxnError>,
}

impl ErrorBuilder {
    pub fn new(attempt: &AttemptContext, class: ErrorClass) -> Self {
        let to_raise = match class {
            ErrorClass::FailExpiry => FinalError::TransactionExpired,
            _ => FinalError::TransactionFailed,
        };
        Self {
            transaction_id: attempt.transaction_id().into(),
            attempt_id: attempt.attempt_id().into(),
            class,
            retry_transaction: false,
            rollback_attempt: true,
            to_raise,
            cause: None,
        }
    }

    pub fn cause(self, cause: impl Into<TxnError>) -> Self {
        Self { cause: Some(cause.into()), ..self }
    }

    pub fn retry_transaction(self) -> Self {
        Self { retry_transaction: true, ..self }
    }

    pub fn do_not_rollback_attempt(self) -> Self {
        Self { rollback_attempt: false, ..self }
    }

    pub fn raise(self, to_raise: FinalError) -> Self {
        Self { to_raise, ..self }
    }

    pub fn build(self) -> TxnError {
        let cause = self.cause.unwrap_or_else(|| TxnError::Internal(anyhow::anyhow!("{:?}", self.class)));
        TxnError::OperationFailed(TransactionOperationFailed {
            transaction_id: self.transaction_id,
            attempt_id: self.attempt_id,
            class: self.class,
            retry_transaction: self.retry_transaction,
            rollback_attempt: self.rollback_attempt,
            to_raise: self.to_raise,
            cause: Arc::new(cause),
        })
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;
    use test_case::test_case;

    use super::*;
    use crate::config::TransactionConfig;

    #[test_case(StoreError::DocumentNotFound, ErrorClass::FailDocNotFound)]
    #[test_case(StoreError::DocumentUnretrievable, ErrorClass::FailDocNotFound)]
    #[test_case(StoreError::Timeout, ErrorClass::FailTransient)]
    #[test_case(StoreError::transient("busy"), ErrorClass::FailTransient)]
    #[test_case(StoreError::hard("corrupted"), ErrorClass::FailHard)]
    #[test_case(StoreError::CasMismatch, ErrorClass::FailCasMismatch)]
    #[test_case(StoreError::Internal(anyhow::anyhow!("boom")), ErrorClass::FailOther)]
    fn store_error_classify(err: StoreError, class: ErrorClass) {
        assert_that!(err.classify()).is_equal_to(class);
    }

    #[test]
    fn error_builder_stamps_attempt() {
        let attempt = AttemptContext::new(&TransactionConfig::default());
        let err = ErrorBuilder::new(&attempt, ErrorClass::FailHard)
            .cause(TxnError::AlreadyAborted)
            .do_not_rollback_attempt()
            .build();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.transaction_id.as_str()).is_equal_to(attempt.transaction_id());
        assert_that!(failed.attempt_id.as_str()).is_equal_to(attempt.attempt_id());
        assert_that!(failed.class).is_equal_to(ErrorClass::FailHard);
        assert_that!(failed.rollback_attempt).is_false();
        assert_that!(failed.retry_transaction).is_false();
        assert_that!(failed.to_raise).is_equal_to(FinalError::TransactionFailed);
        assert!(matches!(failed.cause.as_ref(), TxnError::AlreadyAborted));
    }

    #[test]
    fn error_builder_expiry_raises_expired() {
        let attempt = AttemptContext::new(&TransactionConfig::default());
        let err = ErrorBuilder::new(&attempt, ErrorClass::FailExpiry).retry_transaction().build();
        let failed = err.operation_failed().unwrap();
        assert_that!(failed.to_raise).is_equal_to(FinalError::TransactionExpired);
        assert_that!(failed.retry_transaction).is_true();
        assert_that!(err.classify()).is_equal_to(ErrorClass::FailExpiry);
    }
}
