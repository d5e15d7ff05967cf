use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::shared::enums::{BillingModel, EntityStatus, OrganizationType};
use crate::core::shared::schema::{
    advertisers, affiliates, campaigns, organizations, profiles, publisher_list_items,
    publisher_lists, tracking_links,
};

/// Entity kinds that can be mirrored to an external provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Advertiser,
    Affiliate,
    Campaign,
    TrackingLink,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Advertiser,
        EntityKind::Affiliate,
        EntityKind::Campaign,
        EntityKind::TrackingLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advertiser => "advertiser",
            Self::Affiliate => "affiliate",
            Self::Campaign => "campaign",
            Self::TrackingLink => "tracking_link",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = organizations, primary_key(organization_id))]
pub struct Organization {
    pub organization_id: i64,
    pub name: String,
    pub org_type: OrganizationType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = organizations)]
pub struct NewOrganization {
    pub name: String,
    pub org_type: OrganizationType,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = profiles)]
pub struct Profile {
    pub profile_id: Uuid,
    pub organization_id: Option<i64>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = advertisers, primary_key(advertiser_id), treat_none_as_null = true)]
pub struct Advertiser {
    pub advertiser_id: i64,
    pub organization_id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub status: EntityStatus,
    pub internal_notes: Option<String>,
    pub default_currency_id: Option<String>,
    pub platform_name: Option<String>,
    pub billing_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Insertable, Deserialize)]
#[diesel(table_name = advertisers)]
pub struct NewAdvertiser {
    pub organization_id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub status: EntityStatus,
    pub internal_notes: Option<String>,
    pub default_currency_id: Option<String>,
    pub platform_name: Option<String>,
    pub billing_details: Option<serde_json::Value>,
}

#[derive(
    Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = affiliates, primary_key(affiliate_id), treat_none_as_null = true)]
pub struct Affiliate {
    pub affiliate_id: i64,
    pub organization_id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub status: EntityStatus,
    pub internal_notes: Option<String>,
    pub default_currency_id: Option<String>,
    pub payment_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Insertable, Deserialize)]
#[diesel(table_name = affiliates)]
pub struct NewAffiliate {
    pub organization_id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub status: EntityStatus,
    pub internal_notes: Option<String>,
    pub default_currency_id: Option<String>,
    pub payment_details: Option<serde_json::Value>,
}

#[derive(
    Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = campaigns, primary_key(campaign_id), treat_none_as_null = true)]
pub struct Campaign {
    pub campaign_id: i64,
    pub organization_id: i64,
    pub advertiser_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: EntityStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub destination_url: Option<String>,
    pub visibility: Option<String>,
    pub currency_id: Option<String>,
    pub payout_type: Option<String>,
    pub payout_amount: Option<BigDecimal>,
    pub revenue_type: Option<String>,
    pub revenue_amount: Option<BigDecimal>,
    pub billing_model: Option<BillingModel>,
    pub daily_conversion_cap: Option<i32>,
    pub global_conversion_cap: Option<i32>,
    pub session_duration: Option<i32>,
    pub internal_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = campaigns)]
pub struct NewCampaign {
    pub organization_id: i64,
    pub advertiser_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: EntityStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub destination_url: Option<String>,
    pub visibility: Option<String>,
    pub currency_id: Option<String>,
    pub payout_type: Option<String>,
    pub payout_amount: Option<BigDecimal>,
    pub revenue_type: Option<String>,
    pub revenue_amount: Option<BigDecimal>,
    pub billing_model: Option<BillingModel>,
    pub daily_conversion_cap: Option<i32>,
    pub global_conversion_cap: Option<i32>,
    pub session_duration: Option<i32>,
    pub internal_notes: Option<String>,
}

impl NewCampaign {
    /// A campaign starts as a draft and stays local until explicitly published.
    pub fn draft(organization_id: i64, advertiser_id: i64, name: impl Into<String>) -> Self {
        Self {
            organization_id,
            advertiser_id,
            name: name.into(),
            description: None,
            status: EntityStatus::Draft,
            start_date: None,
            end_date: None,
            destination_url: None,
            visibility: None,
            currency_id: None,
            payout_type: None,
            payout_amount: None,
            revenue_type: None,
            revenue_amount: None,
            billing_model: None,
            daily_conversion_cap: None,
            global_conversion_cap: None,
            session_duration: None,
            internal_notes: None,
        }
    }
}

#[derive(
    Debug, Clone, Queryable, Selectable, Identifiable, AsChangeset, Serialize, Deserialize,
)]
#[diesel(table_name = tracking_links, primary_key(tracking_link_id), treat_none_as_null = true)]
pub struct TrackingLink {
    pub tracking_link_id: i64,
    pub organization_id: i64,
    pub campaign_id: i64,
    pub affiliate_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: EntityStatus,
    pub tracking_url: Option<String>,
    pub source_id: Option<String>,
    pub sub1: Option<String>,
    pub sub2: Option<String>,
    pub sub3: Option<String>,
    pub sub4: Option<String>,
    pub sub5: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Insertable, Deserialize)]
#[diesel(table_name = tracking_links)]
pub struct NewTrackingLink {
    pub organization_id: i64,
    pub campaign_id: i64,
    pub affiliate_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: EntityStatus,
    pub tracking_url: Option<String>,
    pub source_id: Option<String>,
    pub sub1: Option<String>,
    pub sub2: Option<String>,
    pub sub3: Option<String>,
    pub sub4: Option<String>,
    pub sub5: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = publisher_lists)]
pub struct PublisherList {
    pub list_id: i64,
    pub organization_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = publisher_lists)]
pub struct NewPublisherList {
    pub organization_id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = publisher_list_items)]
pub struct PublisherListItem {
    pub item_id: i64,
    pub list_id: i64,
    pub publisher_domain: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = publisher_list_items)]
pub struct NewPublisherListItem {
    pub list_id: i64,
    pub publisher_domain: String,
    pub notes: Option<String>,
}

/// A locally-owned row that has a provider-side mirror.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirroredEntity {
    Advertiser(Advertiser),
    Affiliate(Affiliate),
    Campaign(Campaign),
    TrackingLink(TrackingLink),
}

impl MirroredEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Advertiser(_) => EntityKind::Advertiser,
            Self::Affiliate(_) => EntityKind::Affiliate,
            Self::Campaign(_) => EntityKind::Campaign,
            Self::TrackingLink(_) => EntityKind::TrackingLink,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Advertiser(a) => a.advertiser_id,
            Self::Affiliate(a) => a.affiliate_id,
            Self::Campaign(c) => c.campaign_id,
            Self::TrackingLink(t) => t.tracking_link_id,
        }
    }

    pub fn status(&self) -> EntityStatus {
        match self {
            Self::Advertiser(a) => a.status,
            Self::Affiliate(a) => a.status,
            Self::Campaign(c) => c.status,
            Self::TrackingLink(t) => t.status,
        }
    }

    /// Rows that must exist on the provider before this one can.
    pub fn parents(&self) -> Vec<(EntityKind, i64)> {
        match self {
            Self::Advertiser(_) | Self::Affiliate(_) => Vec::new(),
            Self::Campaign(c) => vec![(EntityKind::Advertiser, c.advertiser_id)],
            Self::TrackingLink(t) => vec![
                (EntityKind::Campaign, t.campaign_id),
                (EntityKind::Affiliate, t.affiliate_id),
            ],
        }
    }
}
