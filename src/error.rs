use crate::query::{AttrType, FailureKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("unsupported triple pattern: {0}")]
    UnsupportedPattern(String),

    #[error("feature disabled: {0}")]
    UnsupportedFeature(String),

    #[error("inconsistent attribute type: expected {expected:?}, found {found:?}")]
    InconsistentAttrType { expected: AttrType, found: AttrType },

    #[error("transport refused delivery to ({sid}, {tid})")]
    TransportRefused { sid: usize, tid: usize },

    #[error("reply for unknown parent query {0}")]
    UnknownParentReply(i64),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// The wire-level tag carried back to the requestor when a query fails.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            MeshError::UnsupportedPattern(_) => FailureKind::UnsupportedPattern,
            MeshError::UnsupportedFeature(_) => FailureKind::UnsupportedFeature,
            MeshError::InconsistentAttrType { .. } => FailureKind::InconsistentAttrType,
            _ => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
