use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{json_ids, require_type, AccessError};
use crate::core::shared::enums::{AssociationStatus, AssociationType, OrganizationType};
use crate::core::shared::schema::{affiliates, campaigns, organization_associations};
use crate::core::shared::utils::{blocking, DbPool};
use crate::entities::{Affiliate, Campaign};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = organization_associations, primary_key(association_id))]
pub struct OrganizationAssociation {
    pub association_id: i64,
    pub advertiser_org_id: i64,
    pub affiliate_org_id: i64,
    pub status: AssociationStatus,
    pub association_type: AssociationType,
    pub all_affiliates_visible: bool,
    pub all_campaigns_visible: bool,
    pub visible_affiliate_ids: Option<serde_json::Value>,
    pub visible_campaign_ids: Option<serde_json::Value>,
    pub requested_by_user_id: Option<Uuid>,
    pub approved_by_user_id: Option<Uuid>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = organization_associations)]
pub(crate) struct NewAssociation {
    pub advertiser_org_id: i64,
    pub affiliate_org_id: i64,
    pub status: AssociationStatus,
    pub association_type: AssociationType,
    pub all_affiliates_visible: bool,
    pub all_campaigns_visible: bool,
    pub visible_affiliate_ids: Option<serde_json::Value>,
    pub visible_campaign_ids: Option<serde_json::Value>,
    pub requested_by_user_id: Option<Uuid>,
    pub approved_by_user_id: Option<Uuid>,
    pub message: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
}

/// Partial visibility change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VisibilityUpdate {
    pub all_affiliates_visible: Option<bool>,
    pub all_campaigns_visible: Option<bool>,
    pub visible_affiliate_ids: Option<Vec<i64>>,
    pub visible_campaign_ids: Option<Vec<i64>>,
}

/// Visibility columns after normalisation: an id list only survives when
/// the matching "all visible" flag is off.
#[derive(Debug, Clone, PartialEq, AsChangeset)]
#[diesel(table_name = organization_associations, treat_none_as_null = true)]
pub(crate) struct Visibility {
    pub all_affiliates_visible: bool,
    pub all_campaigns_visible: bool,
    pub visible_affiliate_ids: Option<serde_json::Value>,
    pub visible_campaign_ids: Option<serde_json::Value>,
}

impl Visibility {
    pub fn normalized(
        all_affiliates_visible: bool,
        all_campaigns_visible: bool,
        affiliate_ids: Option<serde_json::Value>,
        campaign_ids: Option<serde_json::Value>,
    ) -> Self {
        Self {
            all_affiliates_visible,
            all_campaigns_visible,
            visible_affiliate_ids: if all_affiliates_visible { None } else { affiliate_ids },
            visible_campaign_ids: if all_campaigns_visible { None } else { campaign_ids },
        }
    }

    fn apply(current: &OrganizationAssociation, update: VisibilityUpdate) -> Self {
        Self::normalized(
            update
                .all_affiliates_visible
                .unwrap_or(current.all_affiliates_visible),
            update
                .all_campaigns_visible
                .unwrap_or(current.all_campaigns_visible),
            update
                .visible_affiliate_ids
                .map(|ids| serde_json::json!(ids))
                .or_else(|| current.visible_affiliate_ids.clone()),
            update
                .visible_campaign_ids
                .map(|ids| serde_json::json!(ids))
                .or_else(|| current.visible_campaign_ids.clone()),
        )
    }
}

pub(crate) fn lock_association(
    conn: &mut PgConnection,
    association_id: i64,
) -> Result<OrganizationAssociation, AccessError> {
    organization_associations::table
        .find(association_id)
        .for_update()
        .select(OrganizationAssociation::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| AccessError::NotFound(format!("association {} not found", association_id)))
}

#[derive(Clone)]
pub struct AssociationService {
    pool: DbPool,
}

impl AssociationService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Advertiser-initiated association awaiting the affiliate's approval.
    pub async fn create_invitation_association(
        &self,
        advertiser_org_id: i64,
        affiliate_org_id: i64,
        invited_by: Option<Uuid>,
        message: Option<String>,
    ) -> Result<OrganizationAssociation, AccessError> {
        self.create_pending(
            advertiser_org_id,
            affiliate_org_id,
            AssociationType::Invitation,
            invited_by,
            message,
        )
        .await
    }

    /// Affiliate-initiated request awaiting the advertiser's approval.
    pub async fn create_request(
        &self,
        affiliate_org_id: i64,
        advertiser_org_id: i64,
        requested_by: Option<Uuid>,
        message: Option<String>,
    ) -> Result<OrganizationAssociation, AccessError> {
        self.create_pending(
            advertiser_org_id,
            affiliate_org_id,
            AssociationType::Request,
            requested_by,
            message,
        )
        .await
    }

    async fn create_pending(
        &self,
        advertiser_org_id: i64,
        affiliate_org_id: i64,
        association_type: AssociationType,
        requested_by: Option<Uuid>,
        message: Option<String>,
    ) -> Result<OrganizationAssociation, AccessError> {
        if advertiser_org_id == affiliate_org_id {
            return Err(AccessError::InvalidState(
                "an organization cannot associate with itself".into(),
            ));
        }
        blocking(&self.pool, move |conn| {
            require_type(conn, advertiser_org_id, OrganizationType::Advertiser)?;
            require_type(conn, affiliate_org_id, OrganizationType::Affiliate)?;
            let row = NewAssociation {
                advertiser_org_id,
                affiliate_org_id,
                status: AssociationStatus::Pending,
                association_type,
                all_affiliates_visible: true,
                all_campaigns_visible: true,
                visible_affiliate_ids: None,
                visible_campaign_ids: None,
                requested_by_user_id: requested_by,
                approved_by_user_id: None,
                message,
                approved_at: None,
            };
            let association = diesel::insert_into(organization_associations::table)
                .values(&row)
                .returning(OrganizationAssociation::as_returning())
                .get_result(conn)
                .map_err(|e| match AccessError::from(e) {
                    AccessError::Conflict(_) => AccessError::Conflict(format!(
                        "association between {} and {} already exists",
                        advertiser_org_id, affiliate_org_id
                    )),
                    other => other,
                })?;
            info!(
                "Created {} association {} ({} -> {})",
                association_type, association.association_id, advertiser_org_id, affiliate_org_id
            );
            Ok(association)
        })
        .await
    }

    pub async fn approve(
        &self,
        association_id: i64,
        approved_by: Option<Uuid>,
    ) -> Result<OrganizationAssociation, AccessError> {
        self.transition(
            association_id,
            AssociationStatus::Pending,
            AssociationStatus::Active,
            approved_by,
        )
        .await
    }

    pub async fn reject(&self, association_id: i64) -> Result<OrganizationAssociation, AccessError> {
        self.transition(
            association_id,
            AssociationStatus::Pending,
            AssociationStatus::Rejected,
            None,
        )
        .await
    }

    pub async fn suspend(&self, association_id: i64) -> Result<OrganizationAssociation, AccessError> {
        self.transition(
            association_id,
            AssociationStatus::Active,
            AssociationStatus::Suspended,
            None,
        )
        .await
    }

    pub async fn reactivate(
        &self,
        association_id: i64,
    ) -> Result<OrganizationAssociation, AccessError> {
        self.transition(
            association_id,
            AssociationStatus::Suspended,
            AssociationStatus::Active,
            None,
        )
        .await
    }

    async fn transition(
        &self,
        association_id: i64,
        from: AssociationStatus,
        to: AssociationStatus,
        actor: Option<Uuid>,
    ) -> Result<OrganizationAssociation, AccessError> {
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current = lock_association(conn, association_id)?;
                if current.status != from {
                    return Err(AccessError::InvalidState(format!(
                        "association {} is {}; expected {}",
                        association_id, current.status, from
                    )));
                }
                let now = Utc::now();
                let approved_at = match (to, current.approved_at) {
                    (AssociationStatus::Active, None) => Some(now),
                    (_, existing) => existing,
                };
                let approved_by = if to == AssociationStatus::Active && actor.is_some() {
                    actor
                } else {
                    current.approved_by_user_id
                };
                let updated = diesel::update(organization_associations::table.find(association_id))
                    .set((
                        organization_associations::status.eq(to),
                        organization_associations::approved_at.eq(approved_at),
                        organization_associations::approved_by_user_id.eq(approved_by),
                        organization_associations::updated_at.eq(now),
                    ))
                    .returning(OrganizationAssociation::as_returning())
                    .get_result(conn)?;
                info!("Association {} moved {} -> {}", association_id, from, to);
                Ok(updated)
            })
        })
        .await
    }

    pub async fn update_visibility(
        &self,
        association_id: i64,
        update: VisibilityUpdate,
    ) -> Result<OrganizationAssociation, AccessError> {
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let current = lock_association(conn, association_id)?;
                if matches!(
                    current.status,
                    AssociationStatus::Pending | AssociationStatus::Rejected
                ) {
                    return Err(AccessError::InvalidState(format!(
                        "visibility cannot be changed while association is {}",
                        current.status
                    )));
                }
                let visibility = Visibility::apply(&current, update);
                Ok(
                    diesel::update(organization_associations::table.find(association_id))
                        .set((
                            &visibility,
                            organization_associations::updated_at.eq(Utc::now()),
                        ))
                        .returning(OrganizationAssociation::as_returning())
                        .get_result(conn)?,
                )
            })
        })
        .await
    }

    /// Affiliates of the affiliate organization the advertiser may see.
    pub async fn visible_affiliates(&self, association_id: i64) -> Result<Vec<Affiliate>, AccessError> {
        let association = self.get_association(association_id).await?;
        blocking(&self.pool, move |conn| {
            let mut query = affiliates::table
                .filter(affiliates::organization_id.eq(association.affiliate_org_id))
                .into_boxed();
            if !association.all_affiliates_visible {
                let ids = association
                    .visible_affiliate_ids
                    .as_ref()
                    .map(json_ids)
                    .unwrap_or_default();
                query = query.filter(affiliates::affiliate_id.eq_any(ids));
            }
            Ok(query
                .order(affiliates::affiliate_id.asc())
                .select(Affiliate::as_select())
                .load(conn)?)
        })
        .await
    }

    /// Campaigns of the advertiser organization the affiliate may see.
    pub async fn visible_campaigns(&self, association_id: i64) -> Result<Vec<Campaign>, AccessError> {
        let association = self.get_association(association_id).await?;
        blocking(&self.pool, move |conn| {
            let mut query = campaigns::table
                .filter(campaigns::organization_id.eq(association.advertiser_org_id))
                .into_boxed();
            if !association.all_campaigns_visible {
                let ids = association
                    .visible_campaign_ids
                    .as_ref()
                    .map(json_ids)
                    .unwrap_or_default();
                query = query.filter(campaigns::campaign_id.eq_any(ids));
            }
            Ok(query
                .order(campaigns::campaign_id.asc())
                .select(Campaign::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn get_association(
        &self,
        association_id: i64,
    ) -> Result<OrganizationAssociation, AccessError> {
        blocking(&self.pool, move |conn| {
            organization_associations::table
                .find(association_id)
                .select(OrganizationAssociation::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| {
                    AccessError::NotFound(format!("association {} not found", association_id))
                })
        })
        .await
    }

    pub async fn get_by_organizations(
        &self,
        advertiser_org_id: i64,
        affiliate_org_id: i64,
    ) -> Result<Option<OrganizationAssociation>, AccessError> {
        blocking(&self.pool, move |conn| {
            Ok(organization_associations::table
                .filter(organization_associations::advertiser_org_id.eq(advertiser_org_id))
                .filter(organization_associations::affiliate_org_id.eq(affiliate_org_id))
                .select(OrganizationAssociation::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }

    pub async fn list_for_advertiser(
        &self,
        advertiser_org_id: i64,
        status: Option<AssociationStatus>,
    ) -> Result<Vec<OrganizationAssociation>, AccessError> {
        blocking(&self.pool, move |conn| {
            let mut query = organization_associations::table
                .filter(organization_associations::advertiser_org_id.eq(advertiser_org_id))
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(organization_associations::status.eq(status));
            }
            Ok(query
                .order(organization_associations::created_at.desc())
                .select(OrganizationAssociation::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn list_for_affiliate(
        &self,
        affiliate_org_id: i64,
        status: Option<AssociationStatus>,
    ) -> Result<Vec<OrganizationAssociation>, AccessError> {
        blocking(&self.pool, move |conn| {
            let mut query = organization_associations::table
                .filter(organization_associations::affiliate_org_id.eq(affiliate_org_id))
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(organization_associations::status.eq(status));
            }
            Ok(query
                .order(organization_associations::created_at.desc())
                .select(OrganizationAssociation::as_select())
                .load(conn)?)
        })
        .await
    }
}
