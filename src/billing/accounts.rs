use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Datelike, Utc};
use diesel::dsl::{max, sum};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ledger::Ledger;
use super::stripe_integration::{CreateCustomerParams, StripeClient};
use super::{BillingAccount, BillingError, Transaction};
use crate::cache::{OpportunisticCache, DASHBOARD_TTL_SECS};
use crate::core::shared::enums::{
    BillingAccountStatus, BillingMode, TransactionStatus, UsageRecordStatus,
};
use crate::core::shared::schema::{billing_accounts, organizations, transactions, usage_records};
use crate::core::shared::utils::{blocking, DbPool};

const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_INVOICE_DAY: i32 = 1;
const DEFAULT_PAYMENT_TERMS_DAYS: i32 = 30;

#[derive(Debug, Insertable)]
#[diesel(table_name = billing_accounts)]
struct NewBillingAccount {
    organization_id: i64,
    billing_mode: BillingMode,
    currency: String,
    balance: BigDecimal,
    credit_limit: BigDecimal,
    invoice_day_of_month: Option<i32>,
    payment_terms_days: i32,
    status: BillingAccountStatus,
}

impl NewBillingAccount {
    fn defaults(organization_id: i64) -> Self {
        Self {
            organization_id,
            billing_mode: BillingMode::Prepaid,
            currency: DEFAULT_CURRENCY.to_string(),
            balance: BigDecimal::zero(),
            credit_limit: BigDecimal::zero(),
            invoice_day_of_month: Some(DEFAULT_INVOICE_DAY),
            payment_terms_days: DEFAULT_PAYMENT_TERMS_DAYS,
            status: BillingAccountStatus::Active,
        }
    }
}

/// Partial account configuration; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, AsChangeset)]
#[diesel(table_name = billing_accounts)]
pub struct BillingConfigUpdate {
    pub billing_mode: Option<BillingMode>,
    pub credit_limit: Option<BigDecimal>,
    pub default_payment_method_id: Option<String>,
    pub auto_recharge_enabled: Option<bool>,
    pub auto_recharge_threshold: Option<BigDecimal>,
    pub auto_recharge_amount: Option<BigDecimal>,
    pub invoice_day_of_month: Option<i32>,
    pub payment_terms_days: Option<i32>,
    pub status: Option<BillingAccountStatus>,
    pub billing_email: Option<String>,
    pub billing_address: Option<serde_json::Value>,
    pub tax_info: Option<serde_json::Value>,
}

impl BillingConfigUpdate {
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.credit_limit.as_ref().is_some_and(|l| *l < BigDecimal::zero()) {
            return Err(BillingError::InvalidState("credit limit cannot be negative".into()));
        }
        if self.invoice_day_of_month.is_some_and(|d| !(1..=28).contains(&d)) {
            return Err(BillingError::InvalidState(
                "invoice day of month must be between 1 and 28".into(),
            ));
        }
        if self.payment_terms_days.is_some_and(|d| d < 0) {
            return Err(BillingError::InvalidState("payment terms cannot be negative".into()));
        }
        for amount in [&self.auto_recharge_threshold, &self.auto_recharge_amount]
            .into_iter()
            .flatten()
        {
            if *amount < BigDecimal::zero() {
                return Err(BillingError::InvalidState(
                    "auto recharge values cannot be negative".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub organization_id: i64,
    pub billing_mode: BillingMode,
    pub currency: String,
    pub balance: BigDecimal,
    pub credit_limit: BigDecimal,
    pub available: BigDecimal,
    pub month_to_date_spend: BigDecimal,
    pub unbilled_usage: BigDecimal,
    pub last_transaction_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AccountService {
    pool: DbPool,
    stripe: Option<Arc<StripeClient>>,
    cache: OpportunisticCache,
    ledger: Ledger,
}

impl AccountService {
    pub fn new(
        pool: DbPool,
        stripe: Option<Arc<StripeClient>>,
        cache: OpportunisticCache,
        ledger: Ledger,
    ) -> Self {
        Self {
            pool,
            stripe,
            cache,
            ledger,
        }
    }

    /// Returns the organization's account, creating a prepaid USD account on
    /// first use. A Stripe customer is attached when Stripe is configured;
    /// failing to create one does not fail the call.
    pub async fn get_or_create_account(
        &self,
        organization_id: i64,
    ) -> Result<BillingAccount, BillingError> {
        let (account, created, org_name) = blocking(&self.pool, move |conn| {
            let org_name: String = organizations::table
                .find(organization_id)
                .select(organizations::name)
                .first(conn)
                .optional()?
                .ok_or_else(|| {
                    BillingError::NotFound(format!("organization {} not found", organization_id))
                })?;
            let inserted = diesel::insert_into(billing_accounts::table)
                .values(&NewBillingAccount::defaults(organization_id))
                .on_conflict(billing_accounts::organization_id)
                .do_nothing()
                .execute(conn)?;
            let account = billing_accounts::table
                .filter(billing_accounts::organization_id.eq(organization_id))
                .select(BillingAccount::as_select())
                .first(conn)?;
            Ok::<_, BillingError>((account, inserted > 0, org_name))
        })
        .await?;

        if !created {
            return Ok(account);
        }
        info!(
            "Created billing account {} for organization {}",
            account.billing_account_id, organization_id
        );

        let Some(stripe) = self.stripe.clone() else {
            return Ok(account);
        };
        let customer = match stripe
            .create_customer(CreateCustomerParams {
                organization_id,
                email: account.billing_email.clone(),
                name: Some(org_name),
            })
            .await
        {
            Ok(customer) => customer,
            Err(e) => {
                warn!(
                    "Stripe customer creation failed for organization {}: {}",
                    organization_id, e
                );
                return Ok(account);
            }
        };
        let account_id = account.billing_account_id;
        blocking(&self.pool, move |conn| {
            Ok(diesel::update(billing_accounts::table.find(account_id))
                .set((
                    billing_accounts::stripe_customer_id.eq(Some(customer.id)),
                    billing_accounts::updated_at.eq(Utc::now()),
                ))
                .returning(BillingAccount::as_returning())
                .get_result(conn)?)
        })
        .await
    }

    pub async fn get_account(&self, organization_id: i64) -> Result<BillingAccount, BillingError> {
        blocking(&self.pool, move |conn| {
            billing_accounts::table
                .filter(billing_accounts::organization_id.eq(organization_id))
                .select(BillingAccount::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| {
                    BillingError::NotFound(format!(
                        "billing account for organization {} not found",
                        organization_id
                    ))
                })
        })
        .await
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<BillingAccount>, BillingError> {
        blocking(&self.pool, move |conn| {
            Ok(billing_accounts::table
                .filter(billing_accounts::status.eq(BillingAccountStatus::Active))
                .order(billing_accounts::billing_account_id.asc())
                .select(BillingAccount::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn update_config(
        &self,
        organization_id: i64,
        update: BillingConfigUpdate,
    ) -> Result<BillingAccount, BillingError> {
        update.validate()?;
        let account = blocking(&self.pool, move |conn| {
            diesel::update(
                billing_accounts::table.filter(billing_accounts::organization_id.eq(organization_id)),
            )
            .set((&update, billing_accounts::updated_at.eq(Utc::now())))
            .returning(BillingAccount::as_returning())
            .get_result(conn)
            .optional()?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "billing account for organization {} not found",
                    organization_id
                ))
            })
        })
        .await?;
        self.cache.invalidate(&self.dashboard_key(organization_id)).await;
        Ok(account)
    }

    pub async fn transaction_history(
        &self,
        organization_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, BillingError> {
        let limit = limit.clamp(1, 500);
        let offset = offset.max(0);
        blocking(&self.pool, move |conn| {
            Ok(transactions::table
                .filter(transactions::organization_id.eq(organization_id))
                .order(transactions::transaction_id.desc())
                .limit(limit)
                .offset(offset)
                .select(Transaction::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn dashboard_summary(
        &self,
        organization_id: i64,
    ) -> Result<DashboardSummary, BillingError> {
        let key = self.dashboard_key(organization_id);
        if let Some(hit) = self.cache.get_json::<DashboardSummary>(&key).await {
            return Ok(hit);
        }

        let account = self.get_account(organization_id).await?;
        let today = Utc::now().date_naive();
        let month_to_date_spend = self
            .ledger
            .monthly_spend(organization_id, today.year(), today.month())
            .await?;
        let (unbilled, last_transaction_at) = blocking(&self.pool, move |conn| {
            let unbilled: Option<BigDecimal> = usage_records::table
                .filter(usage_records::organization_id.eq(organization_id))
                .filter(usage_records::status.eq(UsageRecordStatus::Allocated))
                .select(sum(usage_records::advertiser_spend))
                .first(conn)?;
            let last: Option<DateTime<Utc>> = transactions::table
                .filter(transactions::organization_id.eq(organization_id))
                .filter(transactions::status.eq(TransactionStatus::Completed))
                .select(max(transactions::processed_at))
                .first(conn)?;
            Ok::<_, BillingError>((unbilled.unwrap_or_else(BigDecimal::zero), last))
        })
        .await?;

        let summary = DashboardSummary {
            organization_id,
            billing_mode: account.billing_mode,
            currency: account.currency.clone(),
            available: &account.balance + &account.credit_limit,
            balance: account.balance,
            credit_limit: account.credit_limit,
            month_to_date_spend,
            unbilled_usage: unbilled,
            last_transaction_at,
        };
        self.cache
            .set_json(&key, &summary, Some(DASHBOARD_TTL_SECS))
            .await;
        Ok(summary)
    }

    fn dashboard_key(&self, organization_id: i64) -> String {
        self.cache
            .key("billing:dashboard", &[&organization_id.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_defaults() {
        let row = NewBillingAccount::defaults(9);
        assert_eq!(row.billing_mode, BillingMode::Prepaid);
        assert_eq!(row.currency, "USD");
        assert_eq!(row.invoice_day_of_month, Some(1));
        assert_eq!(row.payment_terms_days, 30);
        assert!(row.balance.is_zero());
    }

    #[test]
    fn test_update_validation() {
        assert!(BillingConfigUpdate::default().validate().is_ok());
        let bad_limit = BillingConfigUpdate {
            credit_limit: Some(BigDecimal::from_str("-1").unwrap()),
            ..Default::default()
        };
        assert!(bad_limit.validate().is_err());
        let bad_day = BillingConfigUpdate {
            invoice_day_of_month: Some(31),
            ..Default::default()
        };
        assert!(bad_day.validate().is_err());
        let ok = BillingConfigUpdate {
            billing_mode: Some(BillingMode::Postpaid),
            invoice_day_of_month: Some(28),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }
}
