//! Idempotent Stripe webhook ingestion. Each event id is stored once; side
//! effects are applied in the same DB transaction as the ledger writes they
//! cause, and failed events are retried by the sweeper.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::dsl::sum;
use diesel::prelude::*;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::ledger::{
    append_locked, complete_pending_locked, fail_pending_locked, find_by_payment_intent, lock_account,
    NewLedgerEntry,
};
use super::stripe_integration::{
    from_cents, parse_event, verify_signature, StripeError, StripeWebhookEvent,
};
use super::usage::{mark_billed_through_locked, mark_org_billed_locked};
use super::{BillingError, WebhookEvent};
use crate::core::shared::enums::{TransactionStatus, TransactionType, WebhookEventStatus};
use crate::core::shared::schema::{billing_accounts, transactions, webhook_events};
use crate::core::shared::utils::{blocking, DbPool};

pub const MAX_RETRIES: i32 = 5;

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_events)]
struct NewWebhookEvent {
    stripe_event_id: String,
    event_type: String,
    status: WebhookEventStatus,
    event_data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Processed { webhook_event_id: i64 },
    /// The event id was already stored; nothing was applied.
    Duplicate,
    /// Stored but not applied; the retry sweeper will pick it up.
    Deferred { webhook_event_id: i64, error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    pub processed: usize,
    pub failed: usize,
}

/// What a successfully applied event touched.
#[derive(Debug, Default, PartialEq, Eq)]
struct Applied {
    organization_id: Option<i64>,
    transaction_id: Option<i64>,
}

fn metadata_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get("metadata")?.get(key)?.as_str().filter(|s| !s.is_empty())
}

fn metadata_org(object: &Value) -> Option<i64> {
    metadata_str(object, "organization_id")?.trim().parse().ok()
}

/// `usage_record_ids` metadata: comma-separated ids.
fn metadata_usage_ids(object: &Value) -> Vec<i64> {
    metadata_str(object, "usage_record_ids")
        .map(|raw| raw.split(',').filter_map(|id| id.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn required_str<'a>(object: &'a Value, key: &str) -> Result<&'a str, BillingError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::InvalidState(format!("event object has no {}", key)))
}

fn org_for_customer(conn: &mut PgConnection, customer: Option<&str>) -> Result<Option<i64>, BillingError> {
    let Some(customer) = customer else {
        return Ok(None);
    };
    Ok(billing_accounts::table
        .filter(billing_accounts::stripe_customer_id.eq(customer))
        .select(billing_accounts::organization_id)
        .first(conn)
        .optional()?)
}

fn on_payment_succeeded(conn: &mut PgConnection, intent: &Value) -> Result<Applied, BillingError> {
    let intent_id = required_str(intent, "id")?;
    if let Some(done) = find_by_payment_intent(conn, intent_id, Some(TransactionStatus::Completed))? {
        debug!("Payment intent {} already applied as transaction {}", intent_id, done.transaction_id);
        return Ok(Applied {
            organization_id: Some(done.organization_id),
            transaction_id: Some(done.transaction_id),
        });
    }
    if let Some(pending) = find_by_payment_intent(conn, intent_id, Some(TransactionStatus::Pending))? {
        let txn = complete_pending_locked(conn, pending.transaction_id)?;
        return Ok(Applied {
            organization_id: Some(txn.organization_id),
            transaction_id: Some(txn.transaction_id),
        });
    }

    let organization_id = match metadata_org(intent) {
        Some(id) => id,
        None => org_for_customer(conn, intent.get("customer").and_then(Value::as_str))?.ok_or_else(|| {
            BillingError::InvalidState(format!(
                "payment intent {} has no organization_id metadata",
                intent_id
            ))
        })?,
    };
    let cents = intent
        .get("amount_received")
        .and_then(Value::as_i64)
        .filter(|c| *c > 0)
        .or_else(|| intent.get("amount").and_then(Value::as_i64))
        .ok_or_else(|| BillingError::InvalidState(format!("payment intent {} has no amount", intent_id)))?;
    let txn = append_locked(
        conn,
        NewLedgerEntry::new(organization_id, TransactionType::Recharge, from_cents(cents))
            .description("Stripe payment")
            .payment_intent(intent_id),
    )?;
    Ok(Applied {
        organization_id: Some(organization_id),
        transaction_id: Some(txn.transaction_id),
    })
}

fn on_payment_failed(conn: &mut PgConnection, intent: &Value) -> Result<Applied, BillingError> {
    let intent_id = required_str(intent, "id")?;
    let Some(pending) = find_by_payment_intent(conn, intent_id, Some(TransactionStatus::Pending))? else {
        debug!("No pending recharge for failed payment intent {}", intent_id);
        return Ok(Applied::default());
    };
    let reason = intent
        .get("last_payment_error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("payment failed");
    let txn = fail_pending_locked(conn, pending.transaction_id, reason)?;
    Ok(Applied {
        organization_id: Some(txn.organization_id),
        transaction_id: Some(txn.transaction_id),
    })
}

fn on_invoice_paid(conn: &mut PgConnection, invoice: &Value) -> Result<Applied, BillingError> {
    let ids = metadata_usage_ids(invoice);
    let organization_id = match metadata_org(invoice) {
        Some(id) => id,
        None => org_for_customer(conn, invoice.get("customer").and_then(Value::as_str))?
            .ok_or_else(|| {
                BillingError::InvalidState("invoice cannot be matched to an organization".into())
            })?,
    };
    let count = if !ids.is_empty() {
        mark_org_billed_locked(conn, organization_id, &ids)?
    } else {
        let period_end = invoice
            .get("period_end")
            .and_then(Value::as_i64)
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);
        mark_billed_through_locked(conn, organization_id, period_end.date_naive())?
    };
    info!(
        "Invoice marked {} usage record(s) billed for organization {}",
        count, organization_id
    );
    Ok(Applied {
        organization_id: Some(organization_id),
        transaction_id: None,
    })
}

/// Refund still to append given the charge's cumulative refunded total and the
/// (negative) sum of refunds already on the ledger.
fn refund_delta(total_refunded: &BigDecimal, recorded: &BigDecimal) -> Option<BigDecimal> {
    let delta = total_refunded + recorded;
    (delta > BigDecimal::zero()).then_some(delta)
}

fn on_charge_refunded(conn: &mut PgConnection, charge: &Value) -> Result<Applied, BillingError> {
    let charge_id = required_str(charge, "id")?;
    let cents = charge
        .get("amount_refunded")
        .and_then(Value::as_i64)
        .filter(|c| *c > 0)
        .ok_or_else(|| BillingError::InvalidState(format!("charge {} has no refunded amount", charge_id)))?;
    let original = match charge.get("payment_intent").and_then(Value::as_str) {
        Some(intent_id) => find_by_payment_intent(conn, intent_id, Some(TransactionStatus::Completed))?,
        None => None,
    };
    let organization_id = original
        .as_ref()
        .map(|t| t.organization_id)
        .or_else(|| metadata_org(charge))
        .ok_or_else(|| {
            BillingError::InvalidState(format!("charge {} cannot be matched to an organization", charge_id))
        })?;

    // `amount_refunded` is cumulative per charge; only the unrecorded part is appended.
    lock_account(conn, organization_id)?;
    let recorded: Option<BigDecimal> = transactions::table
        .filter(transactions::stripe_charge_id.eq(charge_id))
        .filter(transactions::transaction_type.eq(TransactionType::Refund))
        .filter(transactions::status.eq(TransactionStatus::Completed))
        .select(sum(transactions::amount))
        .first(conn)?;
    let Some(amount) = refund_delta(&from_cents(cents), &recorded.unwrap_or_else(BigDecimal::zero)) else {
        debug!("Refund on charge {} already recorded", charge_id);
        return Ok(Applied {
            organization_id: Some(organization_id),
            transaction_id: None,
        });
    };

    let mut entry = NewLedgerEntry::new(organization_id, TransactionType::Refund, -amount)
        .description("Stripe refund")
        .charge(charge_id);
    if let Some(original) = &original {
        entry = entry.related(original.transaction_id);
        if let Some(intent) = &original.stripe_payment_intent_id {
            entry = entry.payment_intent(intent.clone());
        }
    }
    let txn = append_locked(conn, entry)?;
    Ok(Applied {
        organization_id: Some(organization_id),
        transaction_id: Some(txn.transaction_id),
    })
}

fn apply(conn: &mut PgConnection, event_type: &str, object: &Value) -> Result<Applied, BillingError> {
    match event_type {
        "payment_intent.succeeded" => on_payment_succeeded(conn, object),
        "payment_intent.payment_failed" => on_payment_failed(conn, object),
        "invoice.paid" | "invoice.payment_succeeded" => on_invoice_paid(conn, object),
        "charge.refunded" => on_charge_refunded(conn, object),
        other => {
            debug!("Ignoring Stripe event type {}", other);
            Ok(Applied::default())
        }
    }
}

/// Status after a failed attempt that brings the count to `retry_count`.
pub fn status_after_failure(retry_count: i32) -> WebhookEventStatus {
    if retry_count < MAX_RETRIES {
        WebhookEventStatus::Pending
    } else {
        WebhookEventStatus::Failed
    }
}

/// Checks the signature when a secret is configured, otherwise only parses.
pub fn verify_event(
    secret: Option<&str>,
    payload: &str,
    signature: Option<&str>,
    now: i64,
) -> Result<StripeWebhookEvent, BillingError> {
    match secret {
        Some(secret) => {
            let header = signature
                .ok_or_else(|| StripeError::InvalidWebhook("Missing Stripe-Signature header".into()))?;
            Ok(verify_signature(payload, header, secret, now)?)
        }
        None => Ok(parse_event(payload)?),
    }
}

/// Result of one attempt on a stored event.
#[derive(Debug)]
enum Attempt {
    Processed,
    Failed(BillingError),
    /// Another worker holds the row, or it is no longer pending.
    Skipped,
}

/// Claims a pending event row and applies it. The claim, the ledger writes
/// and the status update share one transaction, so an event is applied at
/// most once however many workers race on it.
fn process_stored(conn: &mut PgConnection, webhook_event_id: i64) -> Result<Attempt, BillingError> {
    conn.transaction(|conn| {
        let Some(event) = webhook_events::table
            .find(webhook_event_id)
            .filter(webhook_events::status.eq(WebhookEventStatus::Pending))
            .for_update()
            .skip_locked()
            .select(WebhookEvent::as_select())
            .first(conn)
            .optional()?
        else {
            debug!("Webhook event {} already claimed", webhook_event_id);
            return Ok(Attempt::Skipped);
        };
        let object = event
            .event_data
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .unwrap_or(Value::Null);
        // Nested transaction is a savepoint: a failed apply leaves the claim usable.
        let outcome = conn.transaction(|conn| apply(conn, &event.event_type, &object));
        let now = Utc::now();
        match outcome {
            Ok(applied) => {
                diesel::update(webhook_events::table.find(event.webhook_event_id))
                    .set((
                        webhook_events::status.eq(WebhookEventStatus::Processed),
                        webhook_events::processed_at.eq(Some(now)),
                        webhook_events::error_message.eq(None::<String>),
                        webhook_events::organization_id.eq(applied.organization_id),
                        webhook_events::transaction_id.eq(applied.transaction_id),
                        webhook_events::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                info!(
                    "Processed Stripe event {} ({})",
                    event.stripe_event_id, event.event_type
                );
                Ok(Attempt::Processed)
            }
            Err(err) => {
                let retries = event.retry_count + 1;
                diesel::update(webhook_events::table.find(event.webhook_event_id))
                    .set((
                        webhook_events::status.eq(status_after_failure(retries)),
                        webhook_events::retry_count.eq(retries),
                        webhook_events::error_message.eq(Some(err.to_string())),
                        webhook_events::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                warn!(
                    "Stripe event {} ({}) failed attempt {}: {}",
                    event.stripe_event_id, event.event_type, retries, err
                );
                Ok(Attempt::Failed(err))
            }
        }
    })
}

#[derive(Clone)]
pub struct WebhookProcessor {
    pool: DbPool,
    webhook_secret: Option<String>,
}

impl WebhookProcessor {
    pub fn new(pool: DbPool, webhook_secret: Option<String>) -> Self {
        Self {
            pool,
            webhook_secret,
        }
    }

    /// Verifies (when a secret is configured), stores and applies one event.
    pub async fn ingest(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> Result<IngestOutcome, BillingError> {
        let event = verify_event(
            self.webhook_secret.as_deref(),
            payload,
            signature,
            Utc::now().timestamp(),
        )?;
        let envelope: Value =
            serde_json::from_str(payload).map_err(|e| StripeError::Parse(e.to_string()))?;
        let row = NewWebhookEvent {
            stripe_event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            status: WebhookEventStatus::Pending,
            event_data: envelope,
        };

        blocking(&self.pool, move |conn| {
            let stored: Option<WebhookEvent> = diesel::insert_into(webhook_events::table)
                .values(&row)
                .on_conflict(webhook_events::stripe_event_id)
                .do_nothing()
                .returning(WebhookEvent::as_returning())
                .get_result(conn)
                .optional()?;
            let Some(stored) = stored else {
                debug!("Duplicate Stripe event {}", row.stripe_event_id);
                return Ok(IngestOutcome::Duplicate);
            };
            let webhook_event_id = stored.webhook_event_id;
            match process_stored(conn, webhook_event_id)? {
                Attempt::Processed => Ok(IngestOutcome::Processed { webhook_event_id }),
                Attempt::Failed(BillingError::Database(e)) => Err(BillingError::Database(e)),
                Attempt::Failed(e) => Ok(IngestOutcome::Deferred {
                    webhook_event_id,
                    error: e.to_string(),
                }),
                Attempt::Skipped => Ok(IngestOutcome::Deferred {
                    webhook_event_id,
                    error: "event claimed by another worker".into(),
                }),
            }
        })
        .await
    }

    /// Re-applies pending events that still have attempts left, oldest first.
    pub async fn retry_pending(&self, limit: i64) -> Result<RetryReport, BillingError> {
        blocking(&self.pool, move |conn| {
            let ids: Vec<i64> = webhook_events::table
                .filter(webhook_events::status.eq(WebhookEventStatus::Pending))
                .filter(webhook_events::retry_count.lt(MAX_RETRIES))
                .order(webhook_events::created_at.asc())
                .limit(limit)
                .select(webhook_events::webhook_event_id)
                .load(conn)?;
            let mut report = RetryReport::default();
            for id in ids {
                match process_stored(conn, id)? {
                    Attempt::Processed => report.processed += 1,
                    Attempt::Failed(_) => report.failed += 1,
                    Attempt::Skipped => continue,
                }
                report.attempted += 1;
            }
            if report.attempted > 0 {
                info!(
                    "Webhook retry: {} attempted, {} processed, {} failed",
                    report.attempted, report.processed, report.failed
                );
            }
            Ok(report)
        })
        .await
    }

    /// Events that exhausted their retries.
    pub async fn failed_events(&self, limit: i64) -> Result<Vec<WebhookEvent>, BillingError> {
        blocking(&self.pool, move |conn| {
            Ok(webhook_events::table
                .filter(webhook_events::status.eq(WebhookEventStatus::Failed))
                .order(webhook_events::updated_at.desc())
                .limit(limit)
                .select(WebhookEvent::as_select())
                .load(conn)?)
        })
        .await
    }

    pub async fn get_event(&self, stripe_event_id: &str) -> Result<Option<WebhookEvent>, BillingError> {
        let stripe_event_id = stripe_event_id.to_string();
        blocking(&self.pool, move |conn| {
            Ok(webhook_events::table
                .filter(webhook_events::stripe_event_id.eq(stripe_event_id))
                .select(WebhookEvent::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }
}
