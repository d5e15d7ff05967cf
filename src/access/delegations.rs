use chrono::{DateTime, Utc};
use diesel::dsl::exists;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::{organization_type, AccessError};
use crate::core::shared::enums::{DelegationPermission, DelegationStatus, OrganizationType};
use crate::core::shared::schema::agency_delegations;
use crate::core::shared::utils::{blocking, DbPool};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = agency_delegations, primary_key(delegation_id))]
pub struct AgencyDelegation {
    pub delegation_id: i64,
    pub agency_org_id: i64,
    pub advertiser_org_id: i64,
    pub status: DelegationStatus,
    pub permissions: serde_json::Value,
    pub delegated_by_user_id: Option<Uuid>,
    pub accepted_by_user_id: Option<Uuid>,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgencyDelegation {
    /// Granted permissions. Unknown tokens in the column are dropped.
    pub fn permission_list(&self) -> Vec<DelegationPermission> {
        self.permissions
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .filter_map(|s| DelegationPermission::from_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = agency_delegations)]
struct NewDelegation {
    agency_org_id: i64,
    advertiser_org_id: i64,
    status: DelegationStatus,
    permissions: serde_json::Value,
    delegated_by_user_id: Option<Uuid>,
    message: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDelegationRequest {
    pub agency_org_id: i64,
    pub advertiser_org_id: i64,
    pub permissions: Vec<String>,
    pub message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Validates permission tokens and returns them deduplicated, in request order.
pub fn parse_permissions(tokens: &[String]) -> Result<Vec<DelegationPermission>, AccessError> {
    if tokens.is_empty() {
        return Err(AccessError::InvalidState(
            "at least one permission is required".into(),
        ));
    }
    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        let perm = DelegationPermission::from_str(token)
            .map_err(|_| AccessError::InvalidState(format!("invalid permission: {}", token)))?;
        if !out.contains(&perm) {
            out.push(perm);
        }
    }
    Ok(out)
}

fn permissions_json(perms: &[DelegationPermission]) -> serde_json::Value {
    serde_json::Value::Array(
        perms
            .iter()
            .map(|p| serde_json::Value::String(p.as_str().to_string()))
            .collect(),
    )
}

fn check_expiration(expires_at: Option<DateTime<Utc>>) -> Result<(), AccessError> {
    if expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(AccessError::InvalidState(
            "expiration date cannot be in the past".into(),
        ));
    }
    Ok(())
}

fn lock_delegation(
    conn: &mut PgConnection,
    delegation_id: i64,
) -> Result<AgencyDelegation, AccessError> {
    agency_delegations::table
        .find(delegation_id)
        .for_update()
        .select(AgencyDelegation::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| AccessError::NotFound(format!("delegation {} not found", delegation_id)))
}

#[derive(Clone)]
pub struct DelegationService {
    pool: DbPool,
}

impl DelegationService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_delegation(
        &self,
        req: CreateDelegationRequest,
        delegated_by: Option<Uuid>,
    ) -> Result<AgencyDelegation, AccessError> {
        if req.agency_org_id == req.advertiser_org_id {
            return Err(AccessError::InvalidState(
                "agency and advertiser organization IDs cannot be the same".into(),
            ));
        }
        let permissions = parse_permissions(&req.permissions)?;
        check_expiration(req.expires_at)?;

        blocking(&self.pool, move |conn| {
            if organization_type(conn, req.agency_org_id)? != OrganizationType::Agency {
                return Err(AccessError::InvalidState(format!(
                    "organization {} is not of type agency",
                    req.agency_org_id
                )));
            }
            if organization_type(conn, req.advertiser_org_id)? != OrganizationType::Advertiser {
                return Err(AccessError::InvalidState(format!(
                    "organization {} is not of type advertiser",
                    req.advertiser_org_id
                )));
            }
            let row = NewDelegation {
                agency_org_id: req.agency_org_id,
                advertiser_org_id: req.advertiser_org_id,
                status: DelegationStatus::Pending,
                permissions: permissions_json(&permissions),
                delegated_by_user_id: delegated_by,
                message: req.message,
                expires_at: req.expires_at,
            };
            let delegation = diesel::insert_into(agency_delegations::table)
                .values(&row)
                .returning(AgencyDelegation::as_returning())
                .get_result(conn)
                .map_err(|e| match AccessError::from(e) {
                    AccessError::Conflict(_) => AccessError::Conflict(format!(
                        "delegation already exists between agency {} and advertiser {}",
                        req.agency_org_id, req.advertiser_org_id
                    )),
                    other => other,
                })?;
            info!(
                "Created delegation {} (agency {} -> advertiser {})",
                delegation.delegation_id, delegation.agency_org_id, delegation.advertiser_org_id
            );
            Ok(delegation)
        })
        .await
    }

    pub async fn accept(
        &self,
        delegation_id: i64,
        accepted_by: Option<Uuid>,
    ) -> Result<AgencyDelegation, AccessError> {
        self.transition(delegation_id, move |current, now| {
            if current.status != DelegationStatus::Pending || current.is_expired(now) {
                return Err(AccessError::InvalidState(format!(
                    "delegation cannot be accepted in current state: {}",
                    current.status
                )));
            }
            Ok(Transition {
                status: DelegationStatus::Active,
                accepted_by: accepted_by.or(current.accepted_by_user_id),
                accepted_at: Some(now),
            })
        })
        .await
    }

    /// Rejecting a pending offer revokes it.
    pub async fn reject(&self, delegation_id: i64) -> Result<AgencyDelegation, AccessError> {
        self.transition(delegation_id, |current, _| {
            if current.status != DelegationStatus::Pending {
                return Err(AccessError::InvalidState(
                    "only pending delegations can be rejected".into(),
                ));
            }
            Ok(Transition::keep(current, DelegationStatus::Revoked))
        })
        .await
    }

    pub async fn suspend(&self, delegation_id: i64) -> Result<AgencyDelegation, AccessError> {
        self.transition(delegation_id, |current, _| {
            if current.status != DelegationStatus::Active {
                return Err(AccessError::InvalidState(format!(
                    "delegation cannot be suspended in current state: {}",
                    current.status
                )));
            }
            Ok(Transition::keep(current, DelegationStatus::Suspended))
        })
        .await
    }

    pub async fn reactivate(&self, delegation_id: i64) -> Result<AgencyDelegation, AccessError> {
        self.transition(delegation_id, |current, now| {
            if current.status != DelegationStatus::Suspended || current.is_expired(now) {
                return Err(AccessError::InvalidState(format!(
                    "delegation cannot be reactivated in current state: {}",
                    current.status
                )));
            }
            Ok(Transition::keep(current, DelegationStatus::Active))
        })
        .await
    }

    pub async fn revoke(&self, delegation_id: i64) -> Result<AgencyDelegation, AccessError> {
        self.transition(delegation_id, |current, _| {
            if !matches!(
                current.status,
                DelegationStatus::Pending | DelegationStatus::Active | DelegationStatus::Suspended
            ) {
                return Err(AccessError::InvalidState(format!(
                    "delegation cannot be revoked in current state: {}",
                    current.status
                )));
            }
            Ok(Transition::keep(current, DelegationStatus::Revoked))
        })
        .await
    }

    async fn transition<F>(
        &self,
        delegation_id: i64,
        decide: F,
    ) -> Result<AgencyDelegation, AccessError>
    where
        F: FnOnce(&AgencyDelegation, DateTime<Utc>) -> Result<Transition, AccessError>
            + Send
            + 'static,
    {
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current = lock_delegation(conn, delegation_id)?;
                let now = Utc::now();
                let next = decide(&current, now)?;
                let updated = diesel::update(agency_delegations::table.find(delegation_id))
                    .set((
                        agency_delegations::status.eq(next.status),
                        agency_delegations::accepted_by_user_id.eq(next.accepted_by),
                        agency_delegations::accepted_at.eq(next.accepted_at),
                        agency_delegations::updated_at.eq(now),
                    ))
                    .returning(AgencyDelegation::as_returning())
                    .get_result(conn)?;
                info!(
                    "Delegation {} moved {} -> {}",
                    delegation_id, current.status, updated.status
                );
                Ok(updated)
            })
        })
        .await
    }

    pub async fn update_permissions(
        &self,
        delegation_id: i64,
        permissions: Vec<String>,
    ) -> Result<AgencyDelegation, AccessError> {
        let permissions = permissions_json(&parse_permissions(&permissions)?);
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current = lock_delegation(conn, delegation_id)?;
                if current.status == DelegationStatus::Revoked
                    || current.status == DelegationStatus::Expired
                {
                    return Err(AccessError::InvalidState(format!(
                        "delegation permissions cannot be changed in current state: {}",
                        current.status
                    )));
                }
                Ok(diesel::update(agency_delegations::table.find(delegation_id))
                    .set((
                        agency_delegations::permissions.eq(permissions),
                        agency_delegations::updated_at.eq(Utc::now()),
                    ))
                    .returning(AgencyDelegation::as_returning())
                    .get_result(conn)?)
            })
        })
        .await
    }

    /// `None` removes the expiry.
    pub async fn update_expiration(
        &self,
        delegation_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AgencyDelegation, AccessError> {
        check_expiration(expires_at)?;
        blocking(&self.pool, move |conn| {
            let updated = diesel::update(agency_delegations::table.find(delegation_id))
                .set((
                    agency_delegations::expires_at.eq(expires_at),
                    agency_delegations::updated_at.eq(Utc::now()),
                ))
                .returning(AgencyDelegation::as_returning())
                .get_result(conn)
                .optional()?;
            updated.ok_or_else(|| {
                AccessError::NotFound(format!("delegation {} not found", delegation_id))
            })
        })
        .await
    }

    /// True when an active, unexpired delegation grants `permission`.
    pub async fn has_permission(
        &self,
        agency_org_id: i64,
        advertiser_org_id: i64,
        permission: DelegationPermission,
    ) -> Result<bool, AccessError> {
        blocking(&self.pool, move |conn| {
            granted(conn, agency_org_id, advertiser_org_id, permission)
        })
        .await
    }

    pub async fn check_permissions(
        &self,
        agency_org_id: i64,
        advertiser_org_id: i64,
        permissions: Vec<DelegationPermission>,
    ) -> Result<HashMap<DelegationPermission, bool>, AccessError> {
        blocking(&self.pool, move |conn| {
            let mut out = HashMap::with_capacity(permissions.len());
            for permission in permissions {
                let ok = granted(conn, agency_org_id, advertiser_org_id, permission)?;
                out.insert(permission, ok);
            }
            Ok(out)
        })
        .await
    }

    /// Permissions of the active, unexpired delegation; empty when there is none.
    pub async fn active_permissions(
        &self,
        agency_org_id: i64,
        advertiser_org_id: i64,
    ) -> Result<Vec<DelegationPermission>, AccessError> {
        blocking(&self.pool, move |conn| {
            let now = Utc::now();
            let delegation = agency_delegations::table
                .filter(agency_delegations::agency_org_id.eq(agency_org_id))
                .filter(agency_delegations::advertiser_org_id.eq(advertiser_org_id))
                .filter(agency_delegations::status.eq(DelegationStatus::Active))
                .filter(
                    agency_delegations::expires_at
                        .is_null()
                        .or(agency_delegations::expires_at.gt(now)),
                )
                .select(AgencyDelegation::as_select())
                .first(conn)
                .optional()?;
            Ok(delegation.map(|d| d.permission_list()).unwrap_or_default())
        })
        .await
    }

    /// Revokes pending or active delegations whose expiry has passed.
    pub async fn expire_delegations(&self) -> Result<usize, AccessError> {
        blocking(&self.pool, move |conn| {
            let now = Utc::now();
            let count = diesel::update(
                agency_delegations::table
                    .filter(
                        agency_delegations::status
                            .eq_any([DelegationStatus::Pending, DelegationStatus::Active]),
                    )
                    .filter(agency_delegations::expires_at.is_not_null())
                    .filter(agency_delegations::expires_at.le(now)),
            )
            .set((
                agency_delegations::status.eq(DelegationStatus::Revoked),
                agency_delegations::updated_at.eq(now),
            ))
            .execute(conn)?;
            if count > 0 {
                info!("Revoked {} expired delegation(s)", count);
            }
            Ok(count)
        })
        .await
    }

    pub async fn get_delegation(&self, delegation_id: i64) -> Result<AgencyDelegation, AccessError> {
        blocking(&self.pool, move |conn| {
            agency_delegations::table
                .find(delegation_id)
                .select(AgencyDelegation::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| {
                    AccessError::NotFound(format!("delegation {} not found", delegation_id))
                })
        })
        .await
    }

    pub async fn list_for_agency(
        &self,
        agency_org_id: i64,
    ) -> Result<Vec<AgencyDelegation>, AccessError> {
        blocking(&self.pool, move |conn| {
            Ok(agency_delegations::table
                .filter(agency_delegations::agency_org_id.eq(agency_org_id))
                .order(agency_delegations::created_at.desc())
                .select(AgencyDelegation::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn list_for_advertiser(
        &self,
        advertiser_org_id: i64,
    ) -> Result<Vec<AgencyDelegation>, AccessError> {
        blocking(&self.pool, move |conn| {
            Ok(agency_delegations::table
                .filter(agency_delegations::advertiser_org_id.eq(advertiser_org_id))
                .order(agency_delegations::created_at.desc())
                .select(AgencyDelegation::as_select())
                .load(conn)?)
        })
        .await
    }
}

struct Transition {
    status: DelegationStatus,
    accepted_by: Option<Uuid>,
    accepted_at: Option<DateTime<Utc>>,
}

impl Transition {
    fn keep(current: &AgencyDelegation, status: DelegationStatus) -> Self {
        Self {
            status,
            accepted_by: current.accepted_by_user_id,
            accepted_at: current.accepted_at,
        }
    }
}

fn granted(
    conn: &mut PgConnection,
    agency_org_id: i64,
    advertiser_org_id: i64,
    permission: DelegationPermission,
) -> Result<bool, AccessError> {
    let now = Utc::now();
    let needle = serde_json::json!([permission.as_str()]);
    Ok(diesel::select(exists(
        agency_delegations::table
            .filter(agency_delegations::agency_org_id.eq(agency_org_id))
            .filter(agency_delegations::advertiser_org_id.eq(advertiser_org_id))
            .filter(agency_delegations::status.eq(DelegationStatus::Active))
            .filter(
                agency_delegations::expires_at
                    .is_null()
                    .or(agency_delegations::expires_at.gt(now)),
            )
            .filter(agency_delegations::permissions.contains(needle)),
    ))
    .get_result(conn)?)
}
