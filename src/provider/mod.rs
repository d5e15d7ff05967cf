//! Mirroring of local entities into external affiliate networks.
//!
//! Each advertiser, affiliate, campaign and tracking link owns at most one
//! mapping row per provider. The reconciler drives those rows through
//! `unsynced -> synced | error` and never clears a provider id once learned.

pub mod everflow;
pub mod lock;
pub mod mappers;
pub mod reconciler;
pub mod reporting;
pub mod storage;

pub use everflow::{EverflowClient, ProviderClient, ProviderError, ProviderReporting};
pub use reconciler::{EntityPatch, MirrorReconciler, SyncOutcome};
pub use storage::MappingStore;

use chrono::{DateTime, Utc};
use diesel::sql_types::{BigInt, Jsonb, Nullable, Text, Timestamptz};
use diesel::QueryableByName;
use serde::{Deserialize, Serialize};

use crate::core::shared::enums::{ProviderType, SyncStatus};
use crate::core::shared::error::{Classify, ErrorKind};
use crate::entities::EntityError;

#[derive(Debug, Clone, QueryableByName, Serialize, Deserialize)]
pub struct ProviderMapping {
    #[diesel(sql_type = BigInt)]
    pub mapping_id: i64,
    #[diesel(sql_type = BigInt)]
    pub entity_id: i64,
    #[diesel(sql_type = Text)]
    pub provider_type: ProviderType,
    #[diesel(sql_type = Nullable<Text>)]
    pub provider_entity_id: Option<String>,
    /// Ciphertext only.
    #[diesel(sql_type = Nullable<Text>)]
    #[serde(skip_serializing)]
    pub api_credentials: Option<String>,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub provider_config: Option<serde_json::Value>,
    #[diesel(sql_type = Nullable<Jsonb>)]
    pub provider_data: Option<serde_json::Value>,
    #[diesel(sql_type = Text)]
    pub sync_status: SyncStatus,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Text>)]
    pub sync_error: Option<String>,
    #[diesel(sql_type = Timestamptz)]
    pub created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

crate::storage_error_conversions!(MirrorError);

impl From<EntityError> for MirrorError {
    fn from(err: EntityError) -> Self {
        match err {
            EntityError::NotFound(m) => Self::NotFound(m),
            EntityError::Conflict(m) => Self::Conflict(m),
            EntityError::InvalidState(m) => Self::InvalidState(m),
            EntityError::Database(m) => Self::Database(m),
            EntityError::Internal(m) => Self::Internal(m),
        }
    }
}

impl Classify for MirrorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Provider(_) => ErrorKind::ProviderError,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
