//! Prepaid/postpaid billing: accounts, the append-only ledger, daily usage
//! aggregation and Stripe webhook ingestion.

pub mod accounts;
pub mod ledger;
pub mod stripe_integration;
pub mod usage;
pub mod webhooks;

pub use accounts::{AccountService, BillingConfigUpdate, DashboardSummary};
pub use ledger::{BalanceAudit, Ledger, NewLedgerEntry};
pub use stripe_integration::{StripeClient, StripeError};
pub use usage::{
    ActivitySource, CampaignActivity, ProviderActivitySource, UsageAggregator, UsageOutcome,
    UsageRunReport,
};
pub use webhooks::{IngestOutcome, WebhookProcessor};

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::shared::enums::{
    BillingAccountStatus, BillingMode, TransactionStatus, TransactionType, UsageRecordStatus,
    WebhookEventStatus,
};
use crate::core::shared::error::{Classify, ErrorKind};
use crate::core::shared::schema::{billing_accounts, transactions, usage_records, webhook_events};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = billing_accounts, primary_key(billing_account_id))]
pub struct BillingAccount {
    pub billing_account_id: i64,
    pub organization_id: i64,
    pub stripe_customer_id: Option<String>,
    pub billing_mode: BillingMode,
    pub currency: String,
    pub balance: BigDecimal,
    pub credit_limit: BigDecimal,
    pub default_payment_method_id: Option<String>,
    pub auto_recharge_enabled: bool,
    pub auto_recharge_threshold: BigDecimal,
    pub auto_recharge_amount: BigDecimal,
    pub invoice_day_of_month: Option<i32>,
    pub payment_terms_days: i32,
    pub status: BillingAccountStatus,
    pub billing_email: Option<String>,
    pub billing_address: serde_json::Value,
    pub tax_info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BillingAccount {
    /// Lowest balance a prepaid account may reach.
    pub fn floor(&self) -> BigDecimal {
        -self.credit_limit.clone()
    }

    /// Whether a balance change of `amount` is allowed by the account's mode.
    pub fn permits(&self, amount: &BigDecimal) -> bool {
        match self.billing_mode {
            BillingMode::Postpaid => true,
            BillingMode::Prepaid => &self.balance + amount >= self.floor(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = transactions, primary_key(transaction_id))]
pub struct Transaction {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub billing_account_id: i64,
    pub transaction_type: TransactionType,
    pub amount: BigDecimal,
    pub currency: String,
    pub balance_before: BigDecimal,
    pub balance_after: BigDecimal,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub related_transaction_id: Option<i64>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub status: TransactionStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = usage_records, primary_key(usage_record_id))]
pub struct UsageRecord {
    pub usage_record_id: i64,
    pub organization_id: i64,
    pub billing_account_id: i64,
    pub usage_date: NaiveDate,
    pub clicks: i64,
    pub conversions: i64,
    pub impressions: i64,
    pub advertiser_spend: BigDecimal,
    pub affiliate_payout: BigDecimal,
    pub platform_revenue: BigDecimal,
    pub currency: String,
    pub status: UsageRecordStatus,
    pub allocated_at: Option<DateTime<Utc>>,
    pub billed_at: Option<DateTime<Utc>>,
    pub campaign_breakdown: serde_json::Value,
    pub affiliate_breakdown: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = webhook_events, primary_key(webhook_event_id))]
pub struct WebhookEvent {
    pub webhook_event_id: i64,
    pub stripe_event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub event_data: serde_json::Value,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub organization_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Stripe(#[from] StripeError),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

crate::storage_error_conversions!(BillingError);

impl Classify for BillingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Stripe(StripeError::InvalidWebhook(_)) | Self::Stripe(StripeError::Parse(_)) => {
                ErrorKind::InvalidState
            }
            Self::Stripe(_) | Self::Provider(_) => ErrorKind::ProviderError,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<crate::provider::ProviderError> for BillingError {
    fn from(err: crate::provider::ProviderError) -> Self {
        Self::Provider(err.to_string())
    }
}

impl From<crate::provider::MirrorError> for BillingError {
    fn from(err: crate::provider::MirrorError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(err.to_string()),
            ErrorKind::ProviderError => Self::Provider(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}
