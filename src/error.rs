//! Unified error type for the coordinator's public surface.

use crate::types::TaskResultKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("unauthenticated: certificate common name does not match sender")]
    Unauthenticated,

    #[error("unauthorized: endpoint not in admin's allowed set")]
    Unauthorized,

    #[error("wrong round: collaborator submitted for round {submitted}, current is {current}")]
    WrongRound { submitted: u64, current: u64 },

    #[error("duplicate result for {0:?}")]
    DuplicateResult(TaskResultKey),

    #[error("aggregated tensor not ready after bounded wait")]
    NotReady,

    #[error("missing contributor {collaborator} for aggregation of {tensor_name}")]
    MissingContributor { tensor_name: String, collaborator: String },

    #[error("task-group percentages do not evenly partition the assignee set")]
    PartitionError,

    #[error("dynamic task arg {arg_name} value {value} outside range [{min}, {max}]")]
    OutOfRange { arg_name: String, value: f64, min: f64, max: f64 },

    #[error("admin membership change already queued")]
    AlreadyQueued,

    #[error("admin membership change already reflected in authorized_cols")]
    AlreadyAuthorized,

    #[error("malformed cancellation: {0}")]
    MalformedCancellation(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("checkpoint io error: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
