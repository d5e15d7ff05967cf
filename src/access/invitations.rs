use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::associations::{NewAssociation, OrganizationAssociation, Visibility};
use super::{json_ids, require_type, AccessError};
use crate::core::shared::enums::{
    AssociationStatus, AssociationType, InvitationStatus, OrganizationType,
};
use crate::core::shared::schema::{invitation_usage_log, invitations, organization_associations};
use crate::core::shared::utils::{blocking, DbPool};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = invitations, primary_key(invitation_id))]
pub struct Invitation {
    pub invitation_id: i64,
    pub advertiser_org_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub token: String,
    pub allowed_affiliate_org_ids: Option<serde_json::Value>,
    pub max_uses: i32,
    pub current_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: InvitationStatus,
    pub default_all_affiliates_visible: bool,
    pub default_all_campaigns_visible: bool,
    pub default_visible_affiliate_ids: Option<serde_json::Value>,
    pub default_visible_campaign_ids: Option<serde_json::Value>,
    pub created_by_user_id: Uuid,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invitation {
    /// Reason this invitation cannot be redeemed right now, if any.
    pub fn redemption_blocker(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if self.status != InvitationStatus::Active {
            return Some("Invitation is not active");
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return Some("Invitation has expired");
        }
        if self.current_uses >= self.max_uses {
            return Some("Invitation usage limit has been reached");
        }
        None
    }

    /// Only an absent allow-list is unrestricted; an empty one admits nobody.
    pub fn admits(&self, affiliate_org_id: i64) -> bool {
        match &self.allowed_affiliate_org_ids {
            None | Some(serde_json::Value::Null) => true,
            Some(ids) => json_ids(ids).contains(&affiliate_org_id),
        }
    }

    fn default_visibility(&self) -> Visibility {
        Visibility::normalized(
            self.default_all_affiliates_visible,
            self.default_all_campaigns_visible,
            self.default_visible_affiliate_ids.clone(),
            self.default_visible_campaign_ids.clone(),
        )
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = invitations)]
struct NewInvitation {
    advertiser_org_id: i64,
    name: String,
    description: Option<String>,
    token: String,
    allowed_affiliate_org_ids: Option<serde_json::Value>,
    max_uses: i32,
    expires_at: Option<DateTime<Utc>>,
    default_all_affiliates_visible: bool,
    default_all_campaigns_visible: bool,
    default_visible_affiliate_ids: Option<serde_json::Value>,
    default_visible_campaign_ids: Option<serde_json::Value>,
    created_by_user_id: Uuid,
    message: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = invitation_usage_log)]
pub struct InvitationUsage {
    pub usage_id: i64,
    pub invitation_id: i64,
    pub affiliate_org_id: Option<i64>,
    pub used_by_user_id: Option<Uuid>,
    pub association_id: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = invitation_usage_log)]
struct NewInvitationUsage {
    invitation_id: i64,
    affiliate_org_id: Option<i64>,
    used_by_user_id: Option<Uuid>,
    association_id: Option<i64>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    success: bool,
    error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvitationRequest {
    pub advertiser_org_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub allowed_affiliate_org_ids: Option<Vec<i64>>,
    pub max_uses: i32,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub default_all_affiliates_visible: bool,
    #[serde(default = "default_true")]
    pub default_all_campaigns_visible: bool,
    pub default_visible_affiliate_ids: Option<Vec<i64>>,
    pub default_visible_campaign_ids: Option<Vec<i64>>,
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedemptionRequest {
    pub token: String,
    pub affiliate_org_id: i64,
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedemptionResult {
    pub invitation: Invitation,
    pub association: OrganizationAssociation,
}

pub fn invitation_link(base_url: &str, token: &str) -> String {
    format!("{}/invitations/{}", base_url.trim_end_matches('/'), token)
}

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct InvitationService {
    pool: DbPool,
}

impl InvitationService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_invitation(
        &self,
        req: CreateInvitationRequest,
        created_by_user_id: Uuid,
    ) -> Result<Invitation, AccessError> {
        if req.max_uses <= 0 {
            return Err(AccessError::InvalidState("max_uses must be positive".into()));
        }
        if req.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(AccessError::InvalidState(
                "expiration date cannot be in the past".into(),
            ));
        }
        if req.name.trim().is_empty() {
            return Err(AccessError::InvalidState("invitation name is required".into()));
        }
        blocking(&self.pool, move |conn| {
            require_type(conn, req.advertiser_org_id, OrganizationType::Advertiser)?;
            let row = NewInvitation {
                advertiser_org_id: req.advertiser_org_id,
                name: req.name,
                description: req.description,
                token: generate_token(),
                allowed_affiliate_org_ids: req.allowed_affiliate_org_ids.map(|ids| serde_json::json!(ids)),
                max_uses: req.max_uses,
                expires_at: req.expires_at,
                default_all_affiliates_visible: req.default_all_affiliates_visible,
                default_all_campaigns_visible: req.default_all_campaigns_visible,
                default_visible_affiliate_ids: req
                    .default_visible_affiliate_ids
                    .map(|ids| serde_json::json!(ids)),
                default_visible_campaign_ids: req
                    .default_visible_campaign_ids
                    .map(|ids| serde_json::json!(ids)),
                created_by_user_id,
                message: req.message,
            };
            let invitation = diesel::insert_into(invitations::table)
                .values(&row)
                .returning(Invitation::as_returning())
                .get_result(conn)?;
            info!(
                "Created invitation {} for advertiser org {}",
                invitation.invitation_id, invitation.advertiser_org_id
            );
            Ok(invitation)
        })
        .await
    }

    /// Redeems a token for an affiliate organization. Check and increment run
    /// under a row lock, so concurrent redemptions never exceed `max_uses`.
    pub async fn redeem(&self, req: RedemptionRequest) -> Result<RedemptionResult, AccessError> {
        blocking(&self.pool, move |conn| {
            let outcome = conn.transaction(|conn| redeem_locked(conn, &req));
            match outcome {
                Ok(result) => Ok(result),
                Err(err) => {
                    if let Err(log_err) = log_failed_redemption(conn, &req, &err) {
                        warn!("Failed to record invitation usage failure: {}", log_err);
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    pub async fn revoke_invitation(&self, invitation_id: i64) -> Result<Invitation, AccessError> {
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current = lock_invitation(conn, invitation_id)?
                    .ok_or_else(|| AccessError::NotFound("Invitation not found".into()))?;
                if current.status != InvitationStatus::Active {
                    return Err(AccessError::InvalidState(format!(
                        "invitation cannot be revoked in current state: {}",
                        current.status
                    )));
                }
                let revoked = diesel::update(invitations::table.find(invitation_id))
                    .set((
                        invitations::status.eq(InvitationStatus::Revoked),
                        invitations::updated_at.eq(Utc::now()),
                    ))
                    .returning(Invitation::as_returning())
                    .get_result(conn)?;
                info!("Revoked invitation {}", invitation_id);
                Ok(revoked)
            })
        })
        .await
    }

    pub async fn get_invitation(&self, invitation_id: i64) -> Result<Invitation, AccessError> {
        blocking(&self.pool, move |conn| {
            invitations::table
                .find(invitation_id)
                .select(Invitation::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| AccessError::NotFound("Invitation not found".into()))
        })
        .await
    }

    pub async fn get_invitation_by_token(&self, token: &str) -> Result<Invitation, AccessError> {
        let token = token.to_string();
        blocking(&self.pool, move |conn| {
            invitations::table
                .filter(invitations::token.eq(token))
                .select(Invitation::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| AccessError::NotFound("Invitation not found".into()))
        })
        .await
    }

    pub async fn list_invitations(
        &self,
        advertiser_org_id: i64,
    ) -> Result<Vec<Invitation>, AccessError> {
        blocking(&self.pool, move |conn| {
            Ok(invitations::table
                .filter(invitations::advertiser_org_id.eq(advertiser_org_id))
                .order(invitations::created_at.desc())
                .select(Invitation::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn usage_history(
        &self,
        invitation_id: i64,
    ) -> Result<Vec<InvitationUsage>, AccessError> {
        blocking(&self.pool, move |conn| {
            Ok(invitation_usage_log::table
                .filter(invitation_usage_log::invitation_id.eq(invitation_id))
                .order(invitation_usage_log::used_at.desc())
                .select(InvitationUsage::as_select())
                .load(conn)?)
        })
        .await
    }

    /// Marks active invitations past their expiry as expired.
    pub async fn expire_invitations(&self) -> Result<usize, AccessError> {
        blocking(&self.pool, move |conn| {
            let now = Utc::now();
            let count = diesel::update(
                invitations::table
                    .filter(invitations::status.eq(InvitationStatus::Active))
                    .filter(invitations::expires_at.is_not_null())
                    .filter(invitations::expires_at.le(now)),
            )
            .set((
                invitations::status.eq(InvitationStatus::Expired),
                invitations::updated_at.eq(now),
            ))
            .execute(conn)?;
            if count > 0 {
                info!("Expired {} invitation(s)", count);
            }
            Ok(count)
        })
        .await
    }
}

fn lock_invitation(
    conn: &mut PgConnection,
    invitation_id: i64,
) -> Result<Option<Invitation>, AccessError> {
    Ok(invitations::table
        .find(invitation_id)
        .for_update()
        .select(Invitation::as_select())
        .first(conn)
        .optional()?)
}

fn lock_invitation_by_token(
    conn: &mut PgConnection,
    token: &str,
) -> Result<Option<Invitation>, AccessError> {
    Ok(invitations::table
        .filter(invitations::token.eq(token))
        .for_update()
        .select(Invitation::as_select())
        .first(conn)
        .optional()?)
}

fn redeem_locked(
    conn: &mut PgConnection,
    req: &RedemptionRequest,
) -> Result<RedemptionResult, AccessError> {
    let invitation = lock_invitation_by_token(conn, &req.token)?
        .ok_or_else(|| AccessError::NotFound("Invitation not found".into()))?;

    let now = Utc::now();
    if let Some(reason) = invitation.redemption_blocker(now) {
        return Err(AccessError::InvalidState(reason.into()));
    }
    if !invitation.admits(req.affiliate_org_id) {
        return Err(AccessError::InvalidState(
            "Your organization is not allowed to use this invitation".into(),
        ));
    }
    require_type(conn, req.affiliate_org_id, OrganizationType::Affiliate)?;
    let existing: Option<AssociationStatus> = organization_associations::table
        .filter(organization_associations::advertiser_org_id.eq(invitation.advertiser_org_id))
        .filter(organization_associations::affiliate_org_id.eq(req.affiliate_org_id))
        .for_update()
        .select(organization_associations::status)
        .first(conn)
        .optional()?;
    if matches!(
        existing,
        Some(AssociationStatus::Active | AssociationStatus::Suspended)
    ) {
        return Err(AccessError::InvalidState(
            "Association already exists between these organizations".into(),
        ));
    }

    let uses = invitation.current_uses + 1;
    let status = if uses >= invitation.max_uses {
        InvitationStatus::Exhausted
    } else {
        InvitationStatus::Active
    };
    let invitation = diesel::update(invitations::table.find(invitation.invitation_id))
        .set((
            invitations::current_uses.eq(uses),
            invitations::status.eq(status),
            invitations::updated_at.eq(now),
        ))
        .returning(Invitation::as_returning())
        .get_result(conn)?;

    let visibility = invitation.default_visibility();
    let row = NewAssociation {
        advertiser_org_id: invitation.advertiser_org_id,
        affiliate_org_id: req.affiliate_org_id,
        status: AssociationStatus::Active,
        association_type: AssociationType::Invitation,
        all_affiliates_visible: visibility.all_affiliates_visible,
        all_campaigns_visible: visibility.all_campaigns_visible,
        visible_affiliate_ids: visibility.visible_affiliate_ids,
        visible_campaign_ids: visibility.visible_campaign_ids,
        requested_by_user_id: req.user_id,
        approved_by_user_id: req.user_id,
        message: invitation.message.clone(),
        approved_at: Some(now),
    };
    let association = diesel::query_dsl::methods::FilterDsl::filter(
        diesel::insert_into(organization_associations::table)
        .values(&row)
        .on_conflict((
            organization_associations::advertiser_org_id,
            organization_associations::affiliate_org_id,
        ))
        .do_update()
        .set((
            organization_associations::status.eq(excluded(organization_associations::status)),
            organization_associations::association_type
                .eq(excluded(organization_associations::association_type)),
            organization_associations::all_affiliates_visible
                .eq(excluded(organization_associations::all_affiliates_visible)),
            organization_associations::all_campaigns_visible
                .eq(excluded(organization_associations::all_campaigns_visible)),
            organization_associations::visible_affiliate_ids
                .eq(excluded(organization_associations::visible_affiliate_ids)),
            organization_associations::visible_campaign_ids
                .eq(excluded(organization_associations::visible_campaign_ids)),
            organization_associations::approved_by_user_id
                .eq(excluded(organization_associations::approved_by_user_id)),
            organization_associations::approved_at.eq(excluded(organization_associations::approved_at)),
            organization_associations::updated_at.eq(now),
        )),
        organization_associations::status.eq_any([
            AssociationStatus::Pending,
            AssociationStatus::Rejected,
        ]),
    )
        .returning(OrganizationAssociation::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or_else(|| {
            AccessError::InvalidState("Association already exists between these organizations".into())
        })?;

    diesel::insert_into(invitation_usage_log::table)
        .values(&NewInvitationUsage {
            invitation_id: invitation.invitation_id,
            affiliate_org_id: Some(req.affiliate_org_id),
            used_by_user_id: req.user_id,
            association_id: Some(association.association_id),
            ip_address: req.ip_address.clone(),
            user_agent: req.user_agent.clone(),
            success: true,
            error_message: None,
        })
        .execute(conn)?;

    info!(
        "Invitation {} redeemed by affiliate org {} ({}/{} uses)",
        invitation.invitation_id, req.affiliate_org_id, invitation.current_uses, invitation.max_uses
    );
    Ok(RedemptionResult {
        invitation,
        association,
    })
}

/// Usage rows reference the invitation, so a token that matches nothing
/// leaves no trace.
fn log_failed_redemption(
    conn: &mut PgConnection,
    req: &RedemptionRequest,
    err: &AccessError,
) -> Result<(), AccessError> {
    let invitation_id = invitations::table
        .filter(invitations::token.eq(&req.token))
        .select(invitations::invitation_id)
        .first::<i64>(conn)
        .optional()?;
    let Some(invitation_id) = invitation_id else {
        return Ok(());
    };
    diesel::insert_into(invitation_usage_log::table)
        .values(&NewInvitationUsage {
            invitation_id,
            affiliate_org_id: Some(req.affiliate_org_id),
            used_by_user_id: req.user_id,
            association_id: None,
            ip_address: req.ip_address.clone(),
            user_agent: req.user_agent.clone(),
            success: false,
            error_message: Some(err.to_string()),
        })
        .execute(conn)?;
    warn!(
        "Invitation {} redemption by org {} failed: {}",
        invitation_id, req.affiliate_org_id, err
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn invitation() -> Invitation {
        let now = Utc::now();
        Invitation {
            invitation_id: 1,
            advertiser_org_id: 10,
            name: "Spring partners".into(),
            description: None,
            token: generate_token(),
            allowed_affiliate_org_ids: None,
            max_uses: 2,
            current_uses: 0,
            expires_at: Some(now + Duration::days(1)),
            status: InvitationStatus::Active,
            default_all_affiliates_visible: false,
            default_all_campaigns_visible: true,
            default_visible_affiliate_ids: Some(json!([7])),
            default_visible_campaign_ids: Some(json!([3])),
            created_by_user_id: Uuid::new_v4(),
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_token_is_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_link_format() {
        assert_eq!(
            invitation_link("https://app.example.com/", "abc"),
            "https://app.example.com/invitations/abc"
        );
    }

    #[test]
    fn test_blockers_in_order() {
        let now = Utc::now();
        let mut inv = invitation();
        assert_eq!(inv.redemption_blocker(now), None);

        inv.current_uses = 2;
        assert_eq!(
            inv.redemption_blocker(now),
            Some("Invitation usage limit has been reached")
        );

        inv.expires_at = Some(now - Duration::seconds(1));
        assert_eq!(inv.redemption_blocker(now), Some("Invitation has expired"));

        inv.status = InvitationStatus::Revoked;
        assert_eq!(inv.redemption_blocker(now), Some("Invitation is not active"));
    }

    #[test]
    fn test_allow_list() {
        let mut inv = invitation();
        assert!(inv.admits(99));
        inv.allowed_affiliate_org_ids = Some(json!([]));
        assert!(!inv.admits(99));
        inv.allowed_affiliate_org_ids = Some(json!([20, 21]));
        assert!(inv.admits(21));
        assert!(!inv.admits(99));
    }

    #[test]
    fn test_default_visibility_is_normalized() {
        let v = invitation().default_visibility();
        assert_eq!(v.visible_affiliate_ids, Some(json!([7])));
        assert!(v.visible_campaign_ids.is_none());
    }
}
