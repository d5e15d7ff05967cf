//! Status and type enums stored as TEXT columns.
//!
//! Every enum maps to the lowercase snake_case token used in the CHECK
//! constraints of the migrations, both in SQL and in JSON.

use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use std::io::Write;

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $token:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            serde::Deserialize,
            diesel::AsExpression,
            diesel::FromSqlRow,
        )]
        #[diesel(sql_type = Text)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $token),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($token => Ok(Self::$variant),)+
                    _ => Err(format!("Unknown {}: {}", stringify!($name), s)),
                }
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                out.write_all(self.as_str().as_bytes())?;
                Ok(serialize::IsNull::No)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let value = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                value.parse::<Self>().map_err(Into::into)
            }
        }
    };
}

text_enum! {
    /// Tenant kind. Agencies act on behalf of advertisers through delegations.
    OrganizationType {
        Advertiser => "advertiser",
        Affiliate => "affiliate",
        Agency => "agency",
        Platform => "platform",
    }
}

text_enum! {
    /// Lifecycle shared by advertisers, affiliates, campaigns and tracking links.
    EntityStatus {
        Draft => "draft",
        Pending => "pending",
        Active => "active",
        Paused => "paused",
        Archived => "archived",
        Inactive => "inactive",
        Rejected => "rejected",
    }
}

text_enum! {
    SyncStatus {
        Unsynced => "unsynced",
        Pending => "pending",
        Synced => "synced",
        Error => "error",
    }
}

text_enum! {
    InvitationStatus {
        Active => "active",
        Expired => "expired",
        Revoked => "revoked",
        Exhausted => "exhausted",
    }
}

text_enum! {
    AssociationStatus {
        Pending => "pending",
        Active => "active",
        Rejected => "rejected",
        Suspended => "suspended",
    }
}

text_enum! {
    /// Who initiated the association: the advertiser (invitation) or the affiliate (request).
    AssociationType {
        Invitation => "invitation",
        Request => "request",
    }
}

text_enum! {
    DelegationStatus {
        Pending => "pending",
        Active => "active",
        Suspended => "suspended",
        Revoked => "revoked",
        Expired => "expired",
    }
}

text_enum! {
    BillingMode {
        Prepaid => "prepaid",
        Postpaid => "postpaid",
    }
}

text_enum! {
    BillingAccountStatus {
        Active => "active",
        Suspended => "suspended",
        Closed => "closed",
    }
}

text_enum! {
    TransactionType {
        Credit => "credit",
        Debit => "debit",
        UsageCharge => "usage_charge",
        Refund => "refund",
        Adjustment => "adjustment",
        Recharge => "recharge",
    }
}

text_enum! {
    TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
        Reversed => "reversed",
    }
}

text_enum! {
    UsageRecordStatus {
        Pending => "pending",
        Allocated => "allocated",
        Billed => "billed",
    }
}

text_enum! {
    WebhookEventStatus {
        Pending => "pending",
        Processed => "processed",
        Failed => "failed",
    }
}

text_enum! {
    /// How a campaign charges the advertiser.
    BillingModel {
        Click => "click",
        Conversion => "conversion",
    }
}

text_enum! {
    /// External systems a local entity can be mirrored to.
    ProviderType {
        Everflow => "everflow",
    }
}

text_enum! {
    /// Capabilities an advertiser can delegate to an agency.
    DelegationPermission {
        CampaignCreate => "campaign_create",
        CampaignManage => "campaign_manage",
        CampaignView => "campaign_view",
        CampaignDelete => "campaign_delete",
        AssociationInvite => "association_invite",
        AssociationManage => "association_manage",
        AssociationView => "association_view",
        InvitationCreate => "invitation_create",
        InvitationManage => "invitation_manage",
        InvitationView => "invitation_view",
        AnalyticsView => "analytics_view",
        AnalyticsExport => "analytics_export",
        BillingView => "billing_view",
        BillingManage => "billing_manage",
        OrganizationView => "organization_view",
        OrganizationManage => "organization_manage",
    }
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::Unsynced
    }
}

impl EntityStatus {
    /// Drafts never leave the local store.
    pub fn suppresses_sync(&self) -> bool {
        matches!(self, Self::Draft)
    }
}

impl InvitationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl TransactionType {
    /// Sign an amount of this type must carry when appended to the ledger.
    /// `None` means either sign is accepted.
    pub fn required_sign(&self) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match self {
            Self::Debit | Self::UsageCharge | Self::Refund => Some(Ordering::Less),
            Self::Credit | Self::Recharge => Some(Ordering::Greater),
            Self::Adjustment => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tokens_round_trip_through_from_str() {
        for status in SyncStatus::ALL {
            assert_eq!(SyncStatus::from_str(status.as_str()), Ok(*status));
        }
        for kind in TransactionType::ALL {
            assert_eq!(kind.to_string().parse::<TransactionType>(), Ok(*kind));
        }
    }

    #[test]
    fn test_from_str_is_case_insensitive() {
        assert_eq!(
            "Usage_Charge".parse::<TransactionType>(),
            Ok(TransactionType::UsageCharge)
        );
        assert_eq!(" PREPAID ".parse::<BillingMode>(), Ok(BillingMode::Prepaid));
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let err = "archived".parse::<SyncStatus>().unwrap_err();
        assert!(err.contains("SyncStatus"));
    }

    #[test]
    fn test_serde_uses_snake_case_tokens() {
        let json = serde_json::to_string(&TransactionType::UsageCharge).unwrap();
        assert_eq!(json, "\"usage_charge\"");
        let parsed: OrganizationType = serde_json::from_str("\"agency\"").unwrap();
        assert_eq!(parsed, OrganizationType::Agency);
    }

    #[test]
    fn test_only_draft_suppresses_sync() {
        for status in EntityStatus::ALL {
            assert_eq!(status.suppresses_sync(), *status == EntityStatus::Draft);
        }
    }

    #[test]
    fn test_required_signs() {
        use std::cmp::Ordering;
        assert_eq!(TransactionType::UsageCharge.required_sign(), Some(Ordering::Less));
        assert_eq!(TransactionType::Recharge.required_sign(), Some(Ordering::Greater));
        assert_eq!(TransactionType::Adjustment.required_sign(), None);
    }

    #[test]
    fn test_only_active_invitation_is_open() {
        assert!(!InvitationStatus::Active.is_terminal());
        assert!(InvitationStatus::Exhausted.is_terminal());
        assert!(InvitationStatus::Expired.is_terminal());
        assert!(InvitationStatus::Revoked.is_terminal());
    }
}
