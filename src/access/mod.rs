//! Advertiser/affiliate associations, invitation tokens and agency delegations.

pub mod associations;
pub mod delegations;
pub mod invitations;

pub use associations::{AssociationService, OrganizationAssociation, VisibilityUpdate};
pub use delegations::{AgencyDelegation, CreateDelegationRequest, DelegationService};
pub use invitations::{
    invitation_link, CreateInvitationRequest, Invitation, InvitationService, InvitationUsage,
    RedemptionRequest, RedemptionResult,
};

use diesel::prelude::*;

use crate::core::shared::enums::OrganizationType;
use crate::core::shared::error::{Classify, ErrorKind};
use crate::core::shared::schema::organizations;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

crate::storage_error_conversions!(AccessError);

impl Classify for AccessError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub(crate) fn organization_type(
    conn: &mut PgConnection,
    organization_id: i64,
) -> Result<OrganizationType, AccessError> {
    organizations::table
        .find(organization_id)
        .select(organizations::org_type)
        .first::<OrganizationType>(conn)
        .optional()?
        .ok_or_else(|| AccessError::NotFound(format!("organization {} not found", organization_id)))
}

pub(crate) fn require_type(
    conn: &mut PgConnection,
    organization_id: i64,
    expected: OrganizationType,
) -> Result<(), AccessError> {
    let actual = organization_type(conn, organization_id)?;
    if actual != expected {
        return Err(AccessError::InvalidState(format!(
            "organization {} is not of type {}",
            organization_id, expected
        )));
    }
    Ok(())
}

/// Integer ids stored in a JSONB array column. Non-integer entries are ignored.
pub(crate) fn json_ids(value: &serde_json::Value) -> Vec<i64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(serde_json::Value::as_i64).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_ids_skips_non_integers() {
        let ids = json_ids(&serde_json::json!([3, "x", 9, null]));
        assert_eq!(ids, vec![3, 9]);
        assert!(json_ids(&serde_json::json!({"a": 1})).is_empty());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            AccessError::InvalidState("Invitation has expired".into()).kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            AccessError::NotFound("Invitation not found".into()).to_string(),
            "Invitation not found"
        );
    }
}
