use crate::estimate::EstimateStatus;
use crate::guard::Operation;
use crate::request::RequestStatus;
use crate::types::TimeStamp;
use chrono::Utc;

/// Malformed input, rejected before any state is computed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Estimate breakdown must contain at least one line item")]
    EmptyBreakdown,
    #[error("Estimate breakdown has {count} line items, the limit is {max}")]
    TooManyLineItems { count: usize, max: usize },
    #[error("Line item {index} has an empty description")]
    EmptyDescription { index: usize },
    #[error("Line item {index} has a non-positive quantity ({quantity})")]
    NonPositiveQuantity { index: usize, quantity: i64 },
    #[error("Line item {index} has a negative unit price ({unit_price})")]
    NegativeUnitPrice { index: usize, unit_price: i64 },
    #[error("Estimate total overflows at line item {index}")]
    TotalOverflow { index: usize },
    #[error("Declared total {declared} does not match the breakdown total {computed}")]
    TotalMismatch { declared: i64, computed: i64 },
    #[error("Estimate validity deadline is already in the past")]
    DeadlineInPast,
    #[error("Estimate validity deadline is too far in the future to be stored")]
    DeadlineOutOfRange,
    #[error("A {0} is required")]
    MissingReason(&'static str),
    #[error("Service type must not be empty")]
    MissingServiceType,
    #[error("Estimate responses disagree with its {status} status")]
    InconsistentEstimate { status: EstimateStatus },
}

/// Everything an operation of the workflow engine can fail with.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(
        "{operation} is not allowed{}: {reason}",
        .status.map(|s| format!(" while {s}")).unwrap_or_default()
    )]
    InvalidTransition {
        operation: Operation,
        status: Option<RequestStatus>,
        reason: String,
    },
    #[error("{kind} {id} was not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{id} was modified concurrently (expected version {expected:?}, found {found:?})")]
    ConcurrencyConflict {
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("Estimate {id} expired at {valid_until}")]
    ExpiredEstimate {
        id: String,
        valid_until: TimeStamp<Utc>,
    },
    #[error("Caller could not be identified: {0}")]
    Unauthenticated(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Record encoding failure: {0}")]
    Codec(String),
}

impl WorkflowError {
    /// Only a lost compare-and-swap race is worth a re-read and resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn invalid(
        operation: Operation,
        status: RequestStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            operation,
            status: Some(status),
            reason: reason.into(),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for WorkflowError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<minicbor::decode::Error> for WorkflowError {
    fn from(value: minicbor::decode::Error) -> Self {
        Self::Codec(value.to_string())
    }
}
