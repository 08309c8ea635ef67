use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AqlError>;

/// Broad classification of an [`AqlError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Raised before any plan is returned; nothing was executed.
    Planning,
    /// Raised while blocks were running; aborts the query.
    Execution,
    /// A Modify block recorded per-row failures under `ignore_errors`.
    PartialWrite,
}

/// Errors produced while validating, optimizing or executing a plan.
///
/// Every variant carries a stable numeric code (see [`AqlError::code`]) that
/// callers and tests can match on without parsing messages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AqlError {
    /// Plan failed structural validation or could not be decoded.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    /// Optimizer ended up with no candidate plan.
    #[error("optimizer produced no plan: {0}")]
    NoPlan(String),
    /// Referenced collection is unknown to the metadata provider.
    #[error("collection or view not found: {0}")]
    CollectionNotFound(String),
    /// Function name is not registered.
    #[error("usage of unknown function '{0}'")]
    UnknownFunction(String),
    /// Function called with the wrong number of arguments.
    #[error("invalid number of arguments for function '{name}', expected {min} to {max}")]
    ArgumentCount {
        /// Function name.
        name: String,
        /// Minimum accepted arguments.
        min: usize,
        /// Maximum accepted arguments.
        max: usize,
    },
    /// A value could not be converted to the required type.
    #[error("type error: {0}")]
    Type(String),
    /// Division or modulus by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// `FAIL()` was evaluated.
    #[error("FAIL(): {0}")]
    FailCalled(String),
    /// Document lookup by key found nothing.
    #[error("document not found: {0}")]
    DocumentNotFound(String),
    /// Write would violate a unique index.
    #[error("unique constraint violated - in index {index} of type {kind} over '{fields}'; conflicting key: {key}")]
    UniqueConstraint {
        /// Index identifier.
        index: String,
        /// Index kind name.
        kind: String,
        /// Indexed fields.
        fields: String,
        /// Key of the conflicting document.
        key: String,
    },
    /// Document key has an invalid shape.
    #[error("illegal document key: {0}")]
    DocumentKeyBad(String),
    /// Value handed to a Modify block is not an object.
    #[error("invalid document type: {0}")]
    DocumentTypeInvalid(String),
    /// Index referenced by a compiled plan no longer exists.
    #[error("index not found: {0}")]
    IndexNotFound(String),
    /// Storage collaborator reported an I/O failure.
    #[error("storage I/O error: {0}")]
    Storage(String),
    /// A shard stopped responding during dispatch.
    #[error("shard gone: {0}")]
    ShardGone(String),
    /// Shard transport could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Query was cancelled through its cancel token.
    #[error("query killed")]
    Killed,
    /// Query exceeded its maximum runtime.
    #[error("query killed: maximum runtime of {0} ms exceeded")]
    Timeout(u64),
    /// An armed fault-injection point fired.
    #[error("intentional debug error at {0}")]
    FaultInjected(String),
    /// A collection is read after it was modified in the same query.
    #[error("access after data-modification by {0}")]
    AccessAfterModification(String),
    /// Modify blocks recorded failures while ignoring errors.
    #[error("{ignored} of {total} write operations failed; first error: [{first_code}] {first_message}")]
    PartialWrite {
        /// Number of rows that failed.
        ignored: u64,
        /// Number of rows attempted.
        total: u64,
        /// Code of the first recorded failure.
        first_code: u32,
        /// Message of the first recorded failure.
        first_message: String,
    },
    /// A query asked for more memory than a limit allows.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AqlError {
    /// Returns the stable numeric code of the error.
    pub fn code(&self) -> u32 {
        match self {
            AqlError::InvalidPlan(_) => 1590,
            AqlError::NoPlan(_) => 4,
            AqlError::CollectionNotFound(_) => 1203,
            AqlError::UnknownFunction(_) => 1540,
            AqlError::ArgumentCount { .. } => 1541,
            AqlError::Type(_) => 17,
            AqlError::DivisionByZero => 1562,
            AqlError::FailCalled(_) => 1569,
            AqlError::DocumentNotFound(_) => 1202,
            AqlError::UniqueConstraint { .. } => 1210,
            AqlError::DocumentKeyBad(_) => 1221,
            AqlError::DocumentTypeInvalid(_) => 1227,
            AqlError::IndexNotFound(_) => 1212,
            AqlError::Storage(_) => 1305,
            AqlError::ShardGone(_) => 1464,
            AqlError::BackendUnavailable(_) => 1478,
            AqlError::Killed | AqlError::Timeout(_) => 1500,
            AqlError::FaultInjected(_) => 22,
            AqlError::AccessAfterModification(_) => 1579,
            AqlError::PartialWrite { .. } => 1,
            AqlError::ResourceLimit(_) => 32,
            AqlError::Internal(_) => 4,
        }
    }

    /// Returns the category the error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AqlError::InvalidPlan(_)
            | AqlError::NoPlan(_)
            | AqlError::CollectionNotFound(_)
            | AqlError::UnknownFunction(_)
            | AqlError::ArgumentCount { .. }
            | AqlError::AccessAfterModification(_) => ErrorCategory::Planning,
            AqlError::PartialWrite { .. } => ErrorCategory::PartialWrite,
            _ => ErrorCategory::Execution,
        }
    }

    /// Returns true when the error stems from a per-document write failure
    /// that a Modify block may record and skip under `ignore_errors`.
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            AqlError::DocumentNotFound(_)
                | AqlError::UniqueConstraint { .. }
                | AqlError::DocumentKeyBad(_)
                | AqlError::DocumentTypeInvalid(_)
        )
    }

    pub(crate) fn invalid_plan(message: impl Into<String>) -> Self {
        AqlError::InvalidPlan(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        AqlError::Internal(message.into())
    }
}

/// Formats an error together with its numeric code.
pub struct ErrorWithCode<'a>(pub &'a AqlError);

impl fmt::Display for ErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}

impl From<serde_json::Error> for AqlError {
    fn from(err: serde_json::Error) -> Self {
        AqlError::InvalidPlan(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AqlError::Killed.code(), 1500);
        assert_eq!(AqlError::Timeout(10).code(), 1500);
        assert_eq!(AqlError::FaultInjected("SortBlock::doSorting".into()).code(), 22);
        assert_eq!(AqlError::DivisionByZero.code(), 1562);
        assert_eq!(AqlError::DocumentNotFound("k".into()).code(), 1202);
        assert_eq!(AqlError::ResourceLimit("range".into()).code(), 32);
    }

    #[test]
    fn categories_split_planning_from_execution() {
        assert_eq!(
            AqlError::invalid_plan("x").category(),
            ErrorCategory::Planning
        );
        assert_eq!(AqlError::Killed.category(), ErrorCategory::Execution);
        let partial = AqlError::PartialWrite {
            ignored: 1,
            total: 3,
            first_code: 1210,
            first_message: "dup".into(),
        };
        assert_eq!(partial.category(), ErrorCategory::PartialWrite);
    }

    #[test]
    fn display_with_code() {
        let err = AqlError::DivisionByZero;
        assert_eq!(ErrorWithCode(&err).to_string(), "[1562] division by zero");
    }
}
