use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use uuid::Uuid;

use super::types::*;
use super::EntityError;
use crate::core::shared::schema::{
    advertisers, affiliates, campaigns, organizations, profiles, publisher_list_items,
    publisher_lists, tracking_links,
};
use crate::core::shared::utils::{blocking, DbPool};
use crate::provider::storage::load_for_entity;

/// CRUD over locally-owned rows. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct EntityStore {
    pool: DbPool,
}

impl EntityStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create_organization(
        &self,
        new: NewOrganization,
    ) -> Result<Organization, EntityError> {
        blocking(&self.pool, move |conn| {
            let org = diesel::insert_into(organizations::table)
                .values(&new)
                .returning(Organization::as_returning())
                .get_result(conn)?;
            Ok(org)
        })
        .await
    }

    pub async fn get_organization(&self, organization_id: i64) -> Result<Organization, EntityError> {
        blocking(&self.pool, move |conn| {
            organizations::table
                .find(organization_id)
                .select(Organization::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| EntityError::NotFound(format!("organization {}", organization_id)))
        })
        .await
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(organizations::table
                .order(organizations::organization_id.asc())
                .select(Organization::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn create_profile(
        &self,
        organization_id: Option<i64>,
        email: String,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<Profile, EntityError> {
        let now = Utc::now();
        let profile = Profile {
            profile_id: Uuid::new_v4(),
            organization_id,
            email,
            first_name,
            last_name,
            role: "user".to_string(),
            created_at: now,
            updated_at: now,
        };
        blocking(&self.pool, move |conn| {
            let profile = diesel::insert_into(profiles::table)
                .values(&profile)
                .returning(Profile::as_returning())
                .get_result(conn)?;
            Ok(profile)
        })
        .await
    }

    pub async fn get_profile(&self, profile_id: Uuid) -> Result<Profile, EntityError> {
        blocking(&self.pool, move |conn| {
            profiles::table
                .find(profile_id)
                .select(Profile::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| EntityError::NotFound(format!("profile {}", profile_id)))
        })
        .await
    }

    pub async fn list_profiles_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Profile>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(profiles::table
                .filter(profiles::organization_id.eq(organization_id))
                .order(profiles::email.asc())
                .select(Profile::as_select())
                .load(conn)?)
        })
        .await
    }

    // ----- advertisers -----

    pub async fn create_advertiser(&self, new: NewAdvertiser) -> Result<Advertiser, EntityError> {
        blocking(&self.pool, move |conn| {
            let advertiser = diesel::insert_into(advertisers::table)
                .values(&new)
                .returning(Advertiser::as_returning())
                .get_result(conn)?;
            info!(
                "Created advertiser {} for organization {}",
                advertiser.advertiser_id, advertiser.organization_id
            );
            Ok(advertiser)
        })
        .await
    }

    pub async fn get_advertiser(&self, advertiser_id: i64) -> Result<Advertiser, EntityError> {
        blocking(&self.pool, move |conn| find_advertiser(conn, advertiser_id)).await
    }

    pub async fn update_advertiser(&self, mut advertiser: Advertiser) -> Result<Advertiser, EntityError> {
        advertiser.updated_at = Utc::now();
        blocking(&self.pool, move |conn| {
            diesel::update(advertisers::table.find(advertiser.advertiser_id))
                .set(&advertiser)
                .returning(Advertiser::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| {
                    EntityError::NotFound(format!("advertiser {}", advertiser.advertiser_id))
                })
        })
        .await
    }

    pub async fn list_advertisers_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Advertiser>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(advertisers::table
                .filter(advertisers::organization_id.eq(organization_id))
                .order(advertisers::advertiser_id.asc())
                .select(Advertiser::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn delete_advertiser(&self, advertiser_id: i64) -> Result<(), EntityError> {
        blocking(&self.pool, move |conn| {
            log_provider_orphans(conn, EntityKind::Advertiser, advertiser_id);
            let deleted =
                diesel::delete(advertisers::table.find(advertiser_id)).execute(conn)?;
            ensure_deleted(deleted, EntityKind::Advertiser, advertiser_id)
        })
        .await
    }

    // ----- affiliates -----

    pub async fn create_affiliate(&self, new: NewAffiliate) -> Result<Affiliate, EntityError> {
        blocking(&self.pool, move |conn| {
            let affiliate = diesel::insert_into(affiliates::table)
                .values(&new)
                .returning(Affiliate::as_returning())
                .get_result(conn)?;
            info!(
                "Created affiliate {} for organization {}",
                affiliate.affiliate_id, affiliate.organization_id
            );
            Ok(affiliate)
        })
        .await
    }

    pub async fn get_affiliate(&self, affiliate_id: i64) -> Result<Affiliate, EntityError> {
        blocking(&self.pool, move |conn| find_affiliate(conn, affiliate_id)).await
    }

    pub async fn update_affiliate(&self, mut affiliate: Affiliate) -> Result<Affiliate, EntityError> {
        affiliate.updated_at = Utc::now();
        blocking(&self.pool, move |conn| {
            diesel::update(affiliates::table.find(affiliate.affiliate_id))
                .set(&affiliate)
                .returning(Affiliate::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| EntityError::NotFound(format!("affiliate {}", affiliate.affiliate_id)))
        })
        .await
    }

    pub async fn list_affiliates_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Affiliate>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(affiliates::table
                .filter(affiliates::organization_id.eq(organization_id))
                .order(affiliates::affiliate_id.asc())
                .select(Affiliate::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn delete_affiliate(&self, affiliate_id: i64) -> Result<(), EntityError> {
        blocking(&self.pool, move |conn| {
            log_provider_orphans(conn, EntityKind::Affiliate, affiliate_id);
            let deleted = diesel::delete(affiliates::table.find(affiliate_id)).execute(conn)?;
            ensure_deleted(deleted, EntityKind::Affiliate, affiliate_id)
        })
        .await
    }

    // ----- campaigns -----

    pub async fn create_campaign(&self, new: NewCampaign) -> Result<Campaign, EntityError> {
        blocking(&self.pool, move |conn| {
            let advertiser = find_advertiser(conn, new.advertiser_id)?;
            if advertiser.organization_id != new.organization_id {
                return Err(EntityError::InvalidState(format!(
                    "advertiser {} does not belong to organization {}",
                    new.advertiser_id, new.organization_id
                )));
            }
            let campaign = diesel::insert_into(campaigns::table)
                .values(&new)
                .returning(Campaign::as_returning())
                .get_result(conn)?;
            info!(
                "Created campaign {} ({}) for advertiser {}",
                campaign.campaign_id, campaign.status, campaign.advertiser_id
            );
            Ok(campaign)
        })
        .await
    }

    pub async fn get_campaign(&self, campaign_id: i64) -> Result<Campaign, EntityError> {
        blocking(&self.pool, move |conn| find_campaign(conn, campaign_id)).await
    }

    pub async fn update_campaign(&self, mut campaign: Campaign) -> Result<Campaign, EntityError> {
        campaign.updated_at = Utc::now();
        blocking(&self.pool, move |conn| {
            diesel::update(campaigns::table.find(campaign.campaign_id))
                .set(&campaign)
                .returning(Campaign::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| EntityError::NotFound(format!("campaign {}", campaign.campaign_id)))
        })
        .await
    }

    pub async fn list_campaigns_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Campaign>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(campaigns::table
                .filter(campaigns::organization_id.eq(organization_id))
                .order(campaigns::campaign_id.asc())
                .select(Campaign::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn list_campaigns_by_advertiser(
        &self,
        advertiser_id: i64,
    ) -> Result<Vec<Campaign>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(campaigns::table
                .filter(campaigns::advertiser_id.eq(advertiser_id))
                .order(campaigns::campaign_id.asc())
                .select(Campaign::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn delete_campaign(&self, campaign_id: i64) -> Result<(), EntityError> {
        blocking(&self.pool, move |conn| {
            log_provider_orphans(conn, EntityKind::Campaign, campaign_id);
            let deleted = diesel::delete(campaigns::table.find(campaign_id)).execute(conn)?;
            ensure_deleted(deleted, EntityKind::Campaign, campaign_id)
        })
        .await
    }

    // ----- tracking links -----

    pub async fn create_tracking_link(
        &self,
        new: NewTrackingLink,
    ) -> Result<TrackingLink, EntityError> {
        blocking(&self.pool, move |conn| {
            find_campaign(conn, new.campaign_id)?;
            find_affiliate(conn, new.affiliate_id)?;
            let link = diesel::insert_into(tracking_links::table)
                .values(&new)
                .returning(TrackingLink::as_returning())
                .get_result(conn)?;
            Ok(link)
        })
        .await
    }

    pub async fn get_tracking_link(&self, tracking_link_id: i64) -> Result<TrackingLink, EntityError> {
        blocking(&self.pool, move |conn| find_tracking_link(conn, tracking_link_id)).await
    }

    pub async fn update_tracking_link(
        &self,
        mut link: TrackingLink,
    ) -> Result<TrackingLink, EntityError> {
        link.updated_at = Utc::now();
        blocking(&self.pool, move |conn| {
            diesel::update(tracking_links::table.find(link.tracking_link_id))
                .set(&link)
                .returning(TrackingLink::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or_else(|| {
                    EntityError::NotFound(format!("tracking link {}", link.tracking_link_id))
                })
        })
        .await
    }

    pub async fn list_tracking_links_by_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<TrackingLink>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(tracking_links::table
                .filter(tracking_links::organization_id.eq(organization_id))
                .order(tracking_links::tracking_link_id.asc())
                .select(TrackingLink::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn delete_tracking_link(&self, tracking_link_id: i64) -> Result<(), EntityError> {
        blocking(&self.pool, move |conn| {
            log_provider_orphans(conn, EntityKind::TrackingLink, tracking_link_id);
            let deleted =
                diesel::delete(tracking_links::table.find(tracking_link_id)).execute(conn)?;
            ensure_deleted(deleted, EntityKind::TrackingLink, tracking_link_id)
        })
        .await
    }

    // ----- publisher lists -----

    pub async fn create_publisher_list(
        &self,
        new: NewPublisherList,
    ) -> Result<PublisherList, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(diesel::insert_into(publisher_lists::table)
                .values(&new)
                .returning(PublisherList::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    pub async fn add_publisher_list_item(
        &self,
        mut new: NewPublisherListItem,
    ) -> Result<PublisherListItem, EntityError> {
        new.publisher_domain = new.publisher_domain.trim().to_lowercase();
        if new.publisher_domain.is_empty() {
            return Err(EntityError::InvalidState("publisher domain is empty".into()));
        }
        blocking(&self.pool, move |conn| {
            Ok(diesel::insert_into(publisher_list_items::table)
                .values(&new)
                .returning(PublisherListItem::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    pub async fn list_publisher_lists(
        &self,
        organization_id: i64,
    ) -> Result<Vec<PublisherList>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(publisher_lists::table
                .filter(publisher_lists::organization_id.eq(organization_id))
                .order(publisher_lists::name.asc())
                .select(PublisherList::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn list_publisher_list_items(
        &self,
        list_id: i64,
    ) -> Result<Vec<PublisherListItem>, EntityError> {
        blocking(&self.pool, move |conn| {
            Ok(publisher_list_items::table
                .filter(publisher_list_items::list_id.eq(list_id))
                .order(publisher_list_items::publisher_domain.asc())
                .select(PublisherListItem::as_select())
                .load(conn)?)
        })
        .await
    }

    // ----- mirrored rows, used by the reconciler -----

    pub async fn load_mirrored(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<MirroredEntity, EntityError> {
        blocking(&self.pool, move |conn| load_mirrored(conn, kind, entity_id)).await
    }

    pub async fn save_mirrored(&self, entity: MirroredEntity) -> Result<MirroredEntity, EntityError> {
        Ok(match entity {
            MirroredEntity::Advertiser(a) => MirroredEntity::Advertiser(self.update_advertiser(a).await?),
            MirroredEntity::Affiliate(a) => MirroredEntity::Affiliate(self.update_affiliate(a).await?),
            MirroredEntity::Campaign(c) => MirroredEntity::Campaign(self.update_campaign(c).await?),
            MirroredEntity::TrackingLink(t) => {
                MirroredEntity::TrackingLink(self.update_tracking_link(t).await?)
            }
        })
    }
}

pub fn load_mirrored(
    conn: &mut PgConnection,
    kind: EntityKind,
    entity_id: i64,
) -> Result<MirroredEntity, EntityError> {
    Ok(match kind {
        EntityKind::Advertiser => MirroredEntity::Advertiser(find_advertiser(conn, entity_id)?),
        EntityKind::Affiliate => MirroredEntity::Affiliate(find_affiliate(conn, entity_id)?),
        EntityKind::Campaign => MirroredEntity::Campaign(find_campaign(conn, entity_id)?),
        EntityKind::TrackingLink => {
            MirroredEntity::TrackingLink(find_tracking_link(conn, entity_id)?)
        }
    })
}

fn find_advertiser(conn: &mut PgConnection, id: i64) -> Result<Advertiser, EntityError> {
    advertisers::table
        .find(id)
        .select(Advertiser::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| EntityError::NotFound(format!("advertiser {}", id)))
}

fn find_affiliate(conn: &mut PgConnection, id: i64) -> Result<Affiliate, EntityError> {
    affiliates::table
        .find(id)
        .select(Affiliate::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| EntityError::NotFound(format!("affiliate {}", id)))
}

fn find_campaign(conn: &mut PgConnection, id: i64) -> Result<Campaign, EntityError> {
    campaigns::table
        .find(id)
        .select(Campaign::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| EntityError::NotFound(format!("campaign {}", id)))
}

fn find_tracking_link(conn: &mut PgConnection, id: i64) -> Result<TrackingLink, EntityError> {
    tracking_links::table
        .find(id)
        .select(TrackingLink::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| EntityError::NotFound(format!("tracking link {}", id)))
}

/// The provider keeps its rows when a local entity goes away; record what is
/// left behind so an operator can clean it up.
fn log_provider_orphans(conn: &mut PgConnection, kind: EntityKind, entity_id: i64) {
    match load_for_entity(conn, kind, entity_id) {
        Ok(mappings) => {
            for mapping in mappings {
                if let Some(provider_id) = mapping.provider_entity_id.as_deref() {
                    warn!(
                        "Deleting {} {} leaves orphaned {} row {}",
                        kind, entity_id, mapping.provider_type, provider_id
                    );
                }
            }
        }
        Err(e) => warn!("Could not list provider mappings of {} {}: {}", kind, entity_id, e),
    }
}

fn ensure_deleted(rows: usize, kind: EntityKind, entity_id: i64) -> Result<(), EntityError> {
    if rows == 0 {
        return Err(EntityError::NotFound(format!("{} {}", kind, entity_id)));
    }
    info!("Deleted {} {}", kind, entity_id);
    Ok(())
}
