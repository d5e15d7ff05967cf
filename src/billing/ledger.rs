//! Append-only transaction ledger. Every balance change happens under a row
//! lock on the billing account and writes exactly one transaction row.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use diesel::dsl::sum;
use diesel::prelude::*;
use log::{info, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

use super::stripe_integration::{
    transaction_status_for, CreatePaymentIntentParams, StripeClient,
};
use super::{BillingAccount, BillingError, Transaction};
use crate::core::shared::enums::{
    BillingAccountStatus, TransactionStatus, TransactionType,
};
use crate::core::shared::schema::{billing_accounts, transactions};
use crate::core::shared::utils::{blocking, DbPool};

diesel::define_sql_function! {
    fn abs(x: diesel::sql_types::Numeric) -> diesel::sql_types::Numeric;
}

/// A balance change to append. `amount` is signed.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub organization_id: i64,
    pub transaction_type: TransactionType,
    pub amount: BigDecimal,
    pub description: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub related_transaction_id: Option<i64>,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_charge_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewLedgerEntry {
    pub fn new(organization_id: i64, transaction_type: TransactionType, amount: BigDecimal) -> Self {
        Self {
            organization_id,
            transaction_type,
            amount,
            description: None,
            reference_type: None,
            reference_id: None,
            related_transaction_id: None,
            stripe_payment_intent_id: None,
            stripe_invoice_id: None,
            stripe_charge_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn reference(mut self, kind: impl Into<String>, id: impl ToString) -> Self {
        self.reference_type = Some(kind.into());
        self.reference_id = Some(id.to_string());
        self
    }

    pub fn related(mut self, transaction_id: i64) -> Self {
        self.related_transaction_id = Some(transaction_id);
        self
    }

    pub fn payment_intent(mut self, id: impl Into<String>) -> Self {
        self.stripe_payment_intent_id = Some(id.into());
        self
    }

    pub fn invoice(mut self, id: impl Into<String>) -> Self {
        self.stripe_invoice_id = Some(id.into());
        self
    }

    pub fn charge(mut self, id: impl Into<String>) -> Self {
        self.stripe_charge_id = Some(id.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rejects amounts whose sign does not match the transaction type.
    pub fn check_sign(&self) -> Result<(), BillingError> {
        let actual = self.amount.cmp(&BigDecimal::zero());
        match self.transaction_type.required_sign() {
            Some(expected) if expected != actual => Err(BillingError::InvalidState(format!(
                "{} amount must be {}, got {}",
                self.transaction_type,
                if expected == Ordering::Less { "negative" } else { "positive" },
                self.amount
            ))),
            None if actual == Ordering::Equal => Err(BillingError::InvalidState(
                "adjustment amount must be non-zero".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = transactions)]
struct TransactionRow {
    organization_id: i64,
    billing_account_id: i64,
    transaction_type: TransactionType,
    amount: BigDecimal,
    currency: String,
    balance_before: BigDecimal,
    balance_after: BigDecimal,
    reference_type: Option<String>,
    reference_id: Option<String>,
    related_transaction_id: Option<i64>,
    stripe_payment_intent_id: Option<String>,
    stripe_invoice_id: Option<String>,
    stripe_charge_id: Option<String>,
    description: Option<String>,
    metadata: serde_json::Value,
    status: TransactionStatus,
    processed_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    fn from_entry(
        entry: NewLedgerEntry,
        account: &BillingAccount,
        status: TransactionStatus,
        balance_after: BigDecimal,
        processed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            organization_id: entry.organization_id,
            billing_account_id: account.billing_account_id,
            transaction_type: entry.transaction_type,
            amount: entry.amount,
            currency: account.currency.clone(),
            balance_before: account.balance.clone(),
            balance_after,
            reference_type: entry.reference_type,
            reference_id: entry.reference_id,
            related_transaction_id: entry.related_transaction_id,
            stripe_payment_intent_id: entry.stripe_payment_intent_id,
            stripe_invoice_id: entry.stripe_invoice_id,
            stripe_charge_id: entry.stripe_charge_id,
            description: entry.description,
            metadata: entry.metadata,
            status,
            processed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceAudit {
    pub billing_account_id: i64,
    pub stored: BigDecimal,
    pub ledger_sum: BigDecimal,
    pub last_balance_after: Option<BigDecimal>,
    pub consistent: bool,
}

pub(crate) fn lock_account(
    conn: &mut PgConnection,
    organization_id: i64,
) -> Result<BillingAccount, BillingError> {
    billing_accounts::table
        .filter(billing_accounts::organization_id.eq(organization_id))
        .for_update()
        .select(BillingAccount::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| {
            BillingError::NotFound(format!(
                "billing account for organization {} not found",
                organization_id
            ))
        })
}

fn write_balance(
    conn: &mut PgConnection,
    billing_account_id: i64,
    balance: &BigDecimal,
) -> Result<(), BillingError> {
    diesel::update(billing_accounts::table.find(billing_account_id))
        .set((
            billing_accounts::balance.eq(balance),
            billing_accounts::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Appends a completed entry. Must run inside a DB transaction.
pub(crate) fn append_locked(
    conn: &mut PgConnection,
    entry: NewLedgerEntry,
) -> Result<Transaction, BillingError> {
    entry.check_sign()?;
    let account = lock_account(conn, entry.organization_id)?;
    if account.status == BillingAccountStatus::Closed {
        return Err(BillingError::InvalidState(format!(
            "billing account {} is closed",
            account.billing_account_id
        )));
    }
    if !account.permits(&entry.amount) {
        return Err(BillingError::InvalidState(format!(
            "insufficient balance: {} {} would exceed credit limit {}",
            entry.transaction_type, entry.amount, account.credit_limit
        )));
    }

    let balance_after = &account.balance + &entry.amount;
    let row = TransactionRow::from_entry(
        entry,
        &account,
        TransactionStatus::Completed,
        balance_after.clone(),
        Some(Utc::now()),
    );
    let txn = diesel::insert_into(transactions::table)
        .values(&row)
        .returning(Transaction::as_returning())
        .get_result(conn)?;
    write_balance(conn, account.billing_account_id, &balance_after)?;
    Ok(txn)
}

/// Applies a pending recharge to the balance. Completed rows are returned
/// unchanged.
pub(crate) fn complete_pending_locked(
    conn: &mut PgConnection,
    transaction_id: i64,
) -> Result<Transaction, BillingError> {
    let pending = lock_transaction(conn, transaction_id)?;
    match pending.status {
        TransactionStatus::Completed => return Ok(pending),
        TransactionStatus::Pending => {}
        other => {
            return Err(BillingError::InvalidState(format!(
                "transaction {} is {} and cannot be completed",
                transaction_id, other
            )))
        }
    }
    let account = lock_account(conn, pending.organization_id)?;
    let balance_after = &account.balance + &pending.amount;
    let now = Utc::now();
    let txn = diesel::update(transactions::table.find(transaction_id))
        .set((
            transactions::status.eq(TransactionStatus::Completed),
            transactions::balance_before.eq(&account.balance),
            transactions::balance_after.eq(&balance_after),
            transactions::processed_at.eq(Some(now)),
            transactions::updated_at.eq(now),
        ))
        .returning(Transaction::as_returning())
        .get_result(conn)?;
    write_balance(conn, account.billing_account_id, &balance_after)?;
    info!(
        "Completed pending {} {} for organization {}",
        txn.transaction_type, transaction_id, txn.organization_id
    );
    Ok(txn)
}

pub(crate) fn fail_pending_locked(
    conn: &mut PgConnection,
    transaction_id: i64,
    reason: &str,
) -> Result<Transaction, BillingError> {
    let pending = lock_transaction(conn, transaction_id)?;
    if pending.status != TransactionStatus::Pending {
        return Err(BillingError::InvalidState(format!(
            "transaction {} is {} and cannot be failed",
            transaction_id, pending.status
        )));
    }
    let mut metadata = pending.metadata;
    if let Some(map) = metadata.as_object_mut() {
        map.insert("failure_reason".into(), serde_json::Value::String(reason.to_string()));
    }
    let now = Utc::now();
    Ok(diesel::update(transactions::table.find(transaction_id))
        .set((
            transactions::status.eq(TransactionStatus::Failed),
            transactions::metadata.eq(metadata),
            transactions::processed_at.eq(Some(now)),
            transactions::updated_at.eq(now),
        ))
        .returning(Transaction::as_returning())
        .get_result(conn)?)
}

fn lock_transaction(
    conn: &mut PgConnection,
    transaction_id: i64,
) -> Result<Transaction, BillingError> {
    transactions::table
        .find(transaction_id)
        .for_update()
        .select(Transaction::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| BillingError::NotFound(format!("transaction {} not found", transaction_id)))
}

pub(crate) fn find_by_payment_intent(
    conn: &mut PgConnection,
    payment_intent_id: &str,
    status: Option<TransactionStatus>,
) -> Result<Option<Transaction>, BillingError> {
    let mut query = transactions::table
        .filter(transactions::stripe_payment_intent_id.eq(payment_intent_id))
        .into_boxed();
    if let Some(status) = status {
        query = query.filter(transactions::status.eq(status));
    }
    Ok(query
        .order(transactions::transaction_id.asc())
        .select(Transaction::as_select())
        .first(conn)
        .optional()?)
}

fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>), BillingError> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| BillingError::InvalidState(format!("invalid month {}-{}", year, month)))?;
    let end = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| BillingError::InvalidState(format!("invalid month {}-{}", year, month)))?;
    let at_midnight = |d: NaiveDate| Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN));
    Ok((at_midnight(start), at_midnight(end)))
}

#[derive(Clone)]
pub struct Ledger {
    pool: DbPool,
    stripe: Option<Arc<StripeClient>>,
}

impl Ledger {
    pub fn new(pool: DbPool, stripe: Option<Arc<StripeClient>>) -> Self {
        Self { pool, stripe }
    }

    pub async fn append(&self, entry: NewLedgerEntry) -> Result<Transaction, BillingError> {
        let org = entry.organization_id;
        let kind = entry.transaction_type;
        let txn = blocking(&self.pool, move |conn| {
            conn.transaction(|conn| append_locked(conn, entry))
        })
        .await?;
        info!(
            "Ledger {} {} for organization {} (balance {} -> {})",
            kind, txn.amount, org, txn.balance_before, txn.balance_after
        );
        Ok(txn)
    }

    pub async fn complete_pending(&self, transaction_id: i64) -> Result<Transaction, BillingError> {
        blocking(&self.pool, move |conn| {
            conn.transaction(|conn| complete_pending_locked(conn, transaction_id))
        })
        .await
    }

    pub async fn fail_pending(
        &self,
        transaction_id: i64,
        reason: &str,
    ) -> Result<Transaction, BillingError> {
        let reason = reason.to_string();
        let txn = blocking(&self.pool, move |conn| {
            conn.transaction(|conn| fail_pending_locked(conn, transaction_id, &reason))
        })
        .await?;
        warn!("Pending transaction {} failed", transaction_id);
        Ok(txn)
    }

    /// Tops up an account. With Stripe configured the balance only moves
    /// once the payment intent succeeds; without it the credit is immediate.
    pub async fn recharge(
        &self,
        organization_id: i64,
        amount: BigDecimal,
        payment_method: Option<String>,
    ) -> Result<Transaction, BillingError> {
        if amount <= BigDecimal::zero() {
            return Err(BillingError::InvalidState(
                "recharge amount must be positive".into(),
            ));
        }
        let Some(stripe) = self.stripe.clone() else {
            return self
                .append(
                    NewLedgerEntry::new(organization_id, TransactionType::Recharge, amount)
                        .description("Account recharge"),
                )
                .await;
        };

        let account = self.account(organization_id).await?;
        let intent = stripe
            .create_payment_intent(CreatePaymentIntentParams {
                organization_id,
                customer_id: account.stripe_customer_id.clone(),
                amount: amount.clone(),
                currency: account.currency.clone(),
                payment_method: payment_method.or(account.default_payment_method_id.clone()),
            })
            .await?;
        let status = transaction_status_for(&intent.status);

        let entry = NewLedgerEntry::new(organization_id, TransactionType::Recharge, amount)
            .description("Account recharge")
            .payment_intent(intent.id.clone())
            .metadata(serde_json::json!({ "payment_intent_status": intent.status }));
        let intent_id = intent.id;
        let txn = blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let account = lock_account(conn, organization_id)?;
                let row = TransactionRow::from_entry(
                    entry,
                    &account,
                    TransactionStatus::Pending,
                    account.balance.clone(),
                    None,
                );
                let pending: Transaction = diesel::insert_into(transactions::table)
                    .values(&row)
                    .returning(Transaction::as_returning())
                    .get_result(conn)?;
                match status {
                    TransactionStatus::Completed => {
                        complete_pending_locked(conn, pending.transaction_id)
                    }
                    TransactionStatus::Pending => Ok(pending),
                    other => fail_pending_locked(
                        conn,
                        pending.transaction_id,
                        &format!("payment intent {}", other),
                    ),
                }
            })
        })
        .await?;
        info!(
            "Recharge {} for organization {} via payment intent {} is {}",
            txn.amount, organization_id, intent_id, txn.status
        );
        Ok(txn)
    }

    /// Charges a positive `amount` against the account.
    pub async fn debit(
        &self,
        organization_id: i64,
        amount: BigDecimal,
        description: &str,
        reference: Option<(String, String)>,
    ) -> Result<Transaction, BillingError> {
        let mut entry = NewLedgerEntry::new(organization_id, TransactionType::Debit, -amount)
            .description(description);
        if let Some((kind, id)) = reference {
            entry = entry.reference(kind, id);
        }
        self.append(entry).await
    }

    pub async fn audit_balance(&self, billing_account_id: i64) -> Result<BalanceAudit, BillingError> {
        blocking(&self.pool, move |conn| {
            let stored: BigDecimal = billing_accounts::table
                .find(billing_account_id)
                .select(billing_accounts::balance)
                .first(conn)
                .optional()?
                .ok_or_else(|| {
                    BillingError::NotFound(format!(
                        "billing account {} not found",
                        billing_account_id
                    ))
                })?;
            let ledger_sum: Option<BigDecimal> = transactions::table
                .filter(transactions::billing_account_id.eq(billing_account_id))
                .filter(transactions::status.eq(TransactionStatus::Completed))
                .select(sum(transactions::amount))
                .first(conn)?;
            let last_balance_after: Option<BigDecimal> = transactions::table
                .filter(transactions::billing_account_id.eq(billing_account_id))
                .filter(transactions::status.eq(TransactionStatus::Completed))
                .order((transactions::processed_at.desc(), transactions::transaction_id.desc()))
                .select(transactions::balance_after)
                .first(conn)
                .optional()?;
            let ledger_sum = ledger_sum.unwrap_or_else(BigDecimal::zero);
            let consistent = ledger_sum == stored
                && last_balance_after.as_ref().map_or(true, |last| *last == stored);
            Ok(BalanceAudit {
                billing_account_id,
                stored,
                ledger_sum,
                last_balance_after,
                consistent,
            })
        })
        .await
    }

    /// Completed usage charges and debits processed in the given month.
    pub async fn monthly_spend(
        &self,
        organization_id: i64,
        year: i32,
        month: u32,
    ) -> Result<BigDecimal, BillingError> {
        let (start, end) = month_bounds(year, month)?;
        blocking(&self.pool, move |conn| {
            let total: Option<BigDecimal> = transactions::table
                .filter(transactions::organization_id.eq(organization_id))
                .filter(transactions::status.eq(TransactionStatus::Completed))
                .filter(
                    transactions::transaction_type
                        .eq_any([TransactionType::UsageCharge, TransactionType::Debit]),
                )
                .filter(transactions::processed_at.ge(start))
                .filter(transactions::processed_at.lt(end))
                .select(sum(abs(transactions::amount)))
                .first(conn)?;
            Ok(total.unwrap_or_else(BigDecimal::zero))
        })
        .await
    }

    async fn account(&self, organization_id: i64) -> Result<BillingAccount, BillingError> {
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_sign_rules() {
        assert!(NewLedgerEntry::new(1, TransactionType::UsageCharge, dec("-1.00"))
            .check_sign()
            .is_ok());
        assert!(NewLedgerEntry::new(1, TransactionType::UsageCharge, dec("1.00"))
            .check_sign()
            .is_err());
        assert!(NewLedgerEntry::new(1, TransactionType::Recharge, dec("0"))
            .check_sign()
            .is_err());
        assert!(NewLedgerEntry::new(1, TransactionType::Refund, dec("-3"))
            .check_sign()
            .is_ok());
        assert!(NewLedgerEntry::new(1, TransactionType::Adjustment, dec("-3"))
            .check_sign()
            .is_ok());
        assert!(NewLedgerEntry::new(1, TransactionType::Adjustment, dec("0"))
            .check_sign()
            .is_err());
    }

    #[test]
    fn test_builder_sets_references() {
        let entry = NewLedgerEntry::new(4, TransactionType::UsageCharge, dec("-2.50"))
            .description("Daily usage charge for 2025-03-14")
            .reference("usage_record", 77);
        assert_eq!(entry.reference_type.as_deref(), Some("usage_record"));
        assert_eq!(entry.reference_id.as_deref(), Some("77"));
    }

    #[test]
    fn test_month_bounds_wrap_december() {
        let (start, end) = month_bounds(2024, 12).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-12-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert!(month_bounds(2024, 13).is_err());
    }
}
