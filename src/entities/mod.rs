//! Local entity store: organizations, profiles and the four mirrored kinds.

pub mod storage;
pub mod types;

pub use storage::EntityStore;
pub use types::*;

use crate::core::shared::error::{Classify, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

crate::storage_error_conversions!(EntityError);

impl Classify for EntityError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
