//! Daily usage aggregation: provider activity is priced per campaign billing
//! model, stored as one usage record per organization and day, and charged
//! to prepaid accounts.

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::accounts::AccountService;
use super::ledger::{append_locked, NewLedgerEntry};
use super::{BillingAccount, BillingError, UsageRecord};
use crate::core::shared::enums::{
    BillingMode, BillingModel, ProviderType, TransactionType, UsageRecordStatus,
};
use crate::core::shared::schema::{campaigns, usage_records};
use crate::core::shared::utils::{blocking, DbPool};
use crate::entities::{Campaign, EntityKind};
use crate::provider::reporting::daily_entity_query;
use crate::provider::{MappingStore, ProviderReporting};

/// Activity of one campaign (optionally split by affiliate) on one day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignActivity {
    pub campaign_id: i64,
    pub affiliate_id: Option<i64>,
    pub clicks: i64,
    pub conversions: i64,
    pub impressions: i64,
}

#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Activity attributed to campaigns owned by `organization_id`.
    async fn daily_activity(
        &self,
        organization_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<CampaignActivity>, BillingError>;

    /// Called once at the start of each aggregation run for `date`.
    async fn begin_run(&self, _date: NaiveDate) {}
}

/// One row of the provider entity report, still in provider ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub offer_id: String,
    pub affiliate_id: Option<String>,
    pub clicks: i64,
    pub conversions: i64,
    pub impressions: i64,
}

fn as_count(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows of an entity report grouped by offer and affiliate. Rows without an
/// offer column are dropped.
pub fn parse_entity_report(report: &Value) -> Vec<ReportRow> {
    let Some(rows) = report.get("table").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let columns = row.get("columns").and_then(Value::as_array)?;
            let column = |kind: &str| {
                columns
                    .iter()
                    .find(|c| c.get("column_type").and_then(Value::as_str) == Some(kind))
                    .and_then(|c| id_string(c.get("id")))
            };
            let stats = row.get("reporting");
            Some(ReportRow {
                offer_id: column("offer")?,
                affiliate_id: column("affiliate"),
                clicks: as_count(stats.and_then(|s| s.get("total_click"))),
                conversions: as_count(stats.and_then(|s| s.get("cv"))),
                impressions: as_count(stats.and_then(|s| s.get("imp"))),
            })
        })
        .collect()
}

/// Reads activity from the provider entity report and maps provider ids back
/// to local campaigns and affiliates through the mapping tables.
pub struct ProviderActivitySource {
    pool: DbPool,
    reporting: Arc<dyn ProviderReporting>,
    mappings: MappingStore,
    provider_type: ProviderType,
    report: Mutex<Option<(NaiveDate, Vec<ReportRow>)>>,
}

impl ProviderActivitySource {
    pub fn new(pool: DbPool, reporting: Arc<dyn ProviderReporting>, mappings: MappingStore) -> Self {
        Self {
            pool,
            reporting,
            mappings,
            provider_type: ProviderType::Everflow,
            report: Mutex::new(None),
        }
    }

    /// The report covers every organization, so it is fetched once per run.
    async fn rows(&self, date: NaiveDate) -> Result<Vec<ReportRow>, BillingError> {
        let mut memo = self.report.lock().await;
        if let Some((day, rows)) = memo.as_ref() {
            if *day == date {
                return Ok(rows.clone());
            }
        }
        let report = self.reporting.entity_report(&daily_entity_query(date)).await?;
        let rows = parse_entity_report(&report);
        debug!("Entity report for {} has {} row(s)", date, rows.len());
        *memo = Some((date, rows.clone()));
        Ok(rows)
    }

    async fn local_id(
        &self,
        kind: EntityKind,
        provider_id: &str,
        cache: &mut HashMap<(EntityKind, String), Option<i64>>,
    ) -> Result<Option<i64>, BillingError> {
        let key = (kind, provider_id.to_string());
        if let Some(hit) = cache.get(&key) {
            return Ok(*hit);
        }
        let id = self
            .mappings
            .find_entity_by_provider_id(kind, self.provider_type, provider_id)
            .await?
            .map(|m| m.entity_id);
        cache.insert(key, id);
        Ok(id)
    }
}

#[async_trait]
impl ActivitySource for ProviderActivitySource {
    async fn daily_activity(
        &self,
        organization_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<CampaignActivity>, BillingError> {
        let rows = self.rows(date).await?;
        let mut ids = HashMap::new();
        let mut mapped = Vec::new();
        for row in rows {
            let Some(campaign_id) = self.local_id(EntityKind::Campaign, &row.offer_id, &mut ids).await? else {
                continue;
            };
            let affiliate_id = match &row.affiliate_id {
                Some(pid) => self.local_id(EntityKind::Affiliate, pid, &mut ids).await?,
                None => None,
            };
            mapped.push(CampaignActivity {
                campaign_id,
                affiliate_id,
                clicks: row.clicks,
                conversions: row.conversions,
                impressions: row.impressions,
            });
        }
        if mapped.is_empty() {
            return Ok(mapped);
        }

        let campaign_ids: Vec<i64> = mapped.iter().map(|a| a.campaign_id).collect();
        let owned: Vec<i64> = blocking(&self.pool, move |conn| {
            Ok::<_, BillingError>(
                campaigns::table
                    .filter(campaigns::campaign_id.eq_any(campaign_ids))
                    .filter(campaigns::organization_id.eq(organization_id))
                    .select(campaigns::campaign_id)
                    .load(conn)?,
            )
        })
        .await?;
        mapped.retain(|a| owned.contains(&a.campaign_id));
        Ok(mapped)
    }

    async fn begin_run(&self, date: NaiveDate) {
        debug!("Dropping cached entity report before usage run for {}", date);
        *self.report.lock().await = None;
    }
}

/// Priced totals for one organization and day.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageTotals {
    pub clicks: i64,
    pub conversions: i64,
    pub impressions: i64,
    pub advertiser_spend: BigDecimal,
    pub affiliate_payout: BigDecimal,
    pub platform_revenue: BigDecimal,
    pub campaign_breakdown: Value,
    pub affiliate_breakdown: Value,
}

/// Billable units under a billing model. Campaigns without a model are free.
fn billable_units(model: Option<BillingModel>, clicks: i64, conversions: i64) -> i64 {
    match model {
        Some(BillingModel::Click) => clicks,
        Some(BillingModel::Conversion) => conversions,
        None => 0,
    }
}

fn price(rate: Option<&BigDecimal>, units: i64) -> BigDecimal {
    rate.map(|r| (r * BigDecimal::from(units)).with_scale(2))
        .unwrap_or_else(|| BigDecimal::zero().with_scale(2))
}

#[derive(Default)]
struct Tally {
    clicks: i64,
    conversions: i64,
    impressions: i64,
    spend: BigDecimal,
    payout: BigDecimal,
}

pub fn compute_usage(campaigns: &[Campaign], activity: &[CampaignActivity]) -> UsageTotals {
    let by_id: HashMap<i64, &Campaign> = campaigns.iter().map(|c| (c.campaign_id, c)).collect();
    let mut per_campaign: BTreeMap<i64, Tally> = BTreeMap::new();
    let mut per_affiliate: BTreeMap<i64, Tally> = BTreeMap::new();

    for row in activity {
        let Some(campaign) = by_id.get(&row.campaign_id) else {
            continue;
        };
        let units = billable_units(campaign.billing_model, row.clicks, row.conversions);
        let spend = price(campaign.revenue_amount.as_ref(), units);
        let payout = price(campaign.payout_amount.as_ref(), units);

        let tally = per_campaign.entry(row.campaign_id).or_default();
        tally.clicks += row.clicks;
        tally.conversions += row.conversions;
        tally.impressions += row.impressions;
        tally.spend += &spend;
        tally.payout += &payout;

        if let Some(affiliate_id) = row.affiliate_id {
            let tally = per_affiliate.entry(affiliate_id).or_default();
            tally.clicks += row.clicks;
            tally.conversions += row.conversions;
            tally.impressions += row.impressions;
            tally.spend += &spend;
            tally.payout += payout;
        }
    }

    let mut totals = UsageTotals {
        clicks: 0,
        conversions: 0,
        impressions: 0,
        advertiser_spend: BigDecimal::zero(),
        affiliate_payout: BigDecimal::zero(),
        platform_revenue: BigDecimal::zero(),
        campaign_breakdown: json!({}),
        affiliate_breakdown: json!({}),
    };
    let mut campaign_breakdown = Map::new();
    for (campaign_id, tally) in &per_campaign {
        let campaign = by_id.get(campaign_id);
        totals.clicks += tally.clicks;
        totals.conversions += tally.conversions;
        totals.impressions += tally.impressions;
        totals.advertiser_spend += &tally.spend;
        totals.affiliate_payout += &tally.payout;
        campaign_breakdown.insert(
            format!("campaign_{}", campaign_id),
            json!({
                "clicks": tally.clicks,
                "conversions": tally.conversions,
                "impressions": tally.impressions,
                "spend": tally.spend.with_scale(2).to_string(),
                "payout": tally.payout.with_scale(2).to_string(),
                "billing_model": campaign.and_then(|c| c.billing_model),
                "revenue_amount": campaign.and_then(|c| c.revenue_amount.as_ref()).map(|v| v.to_string()),
                "payout_amount": campaign.and_then(|c| c.payout_amount.as_ref()).map(|v| v.to_string()),
            }),
        );
    }
    let mut affiliate_breakdown = Map::new();
    for (affiliate_id, tally) in &per_affiliate {
        affiliate_breakdown.insert(
            format!("affiliate_{}", affiliate_id),
            json!({
                "clicks": tally.clicks,
                "conversions": tally.conversions,
                "impressions": tally.impressions,
                "spend": tally.spend.with_scale(2).to_string(),
                "payout": tally.payout.with_scale(2).to_string(),
            }),
        );
    }
    totals.advertiser_spend = totals.advertiser_spend.with_scale(2);
    totals.affiliate_payout = totals.affiliate_payout.with_scale(2);
    totals.platform_revenue = &totals.advertiser_spend - &totals.affiliate_payout;
    totals.campaign_breakdown = Value::Object(campaign_breakdown);
    totals.affiliate_breakdown = Value::Object(affiliate_breakdown);
    totals
}

#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = usage_records)]
struct UsageRow {
    organization_id: i64,
    billing_account_id: i64,
    usage_date: NaiveDate,
    clicks: i64,
    conversions: i64,
    impressions: i64,
    advertiser_spend: BigDecimal,
    affiliate_payout: BigDecimal,
    platform_revenue: BigDecimal,
    currency: String,
    campaign_breakdown: Value,
    affiliate_breakdown: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// A non-pending record already existed, or a concurrent run claimed it.
    Skipped,
    Billed,
    /// Left allocated: postpaid, or a prepaid charge the balance could not cover.
    Allocated,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageRunReport {
    pub usage_date: Option<NaiveDate>,
    pub processed: usize,
    pub billed: usize,
    pub allocated: usize,
    pub skipped: usize,
    pub failed: Vec<(i64, String)>,
}

impl UsageRunReport {
    fn record(&mut self, outcome: UsageOutcome) {
        self.processed += 1;
        match outcome {
            UsageOutcome::Skipped => self.skipped += 1,
            UsageOutcome::Billed => self.billed += 1,
            UsageOutcome::Allocated => self.allocated += 1,
        }
    }
}

pub(crate) fn mark_billed_locked(conn: &mut PgConnection, ids: &[i64]) -> Result<usize, BillingError> {
    let now = Utc::now();
    Ok(diesel::update(
        usage_records::table
            .filter(usage_records::usage_record_id.eq_any(ids))
            .filter(usage_records::status.eq(UsageRecordStatus::Allocated)),
    )
    .set((
        usage_records::status.eq(UsageRecordStatus::Billed),
        usage_records::billed_at.eq(Some(now)),
        usage_records::updated_at.eq(now),
    ))
    .execute(conn)?)
}

/// Marks the listed allocated records of one organization as billed; ids
/// belonging to other organizations are ignored.
pub(crate) fn mark_org_billed_locked(
    conn: &mut PgConnection,
    organization_id: i64,
    ids: &[i64],
) -> Result<usize, BillingError> {
    let now = Utc::now();
    Ok(diesel::update(
        usage_records::table
            .filter(usage_records::organization_id.eq(organization_id))
            .filter(usage_records::usage_record_id.eq_any(ids))
            .filter(usage_records::status.eq(UsageRecordStatus::Allocated)),
    )
    .set((
        usage_records::status.eq(UsageRecordStatus::Billed),
        usage_records::billed_at.eq(Some(now)),
        usage_records::updated_at.eq(now),
    ))
    .execute(conn)?)
}

/// Marks every allocated record of an organization up to `through` as billed.
pub(crate) fn mark_billed_through_locked(
    conn: &mut PgConnection,
    organization_id: i64,
    through: NaiveDate,
) -> Result<usize, BillingError> {
    let now = Utc::now();
    Ok(diesel::update(
        usage_records::table
            .filter(usage_records::organization_id.eq(organization_id))
            .filter(usage_records::status.eq(UsageRecordStatus::Allocated))
            .filter(usage_records::usage_date.le(through)),
    )
    .set((
        usage_records::status.eq(UsageRecordStatus::Billed),
        usage_records::billed_at.eq(Some(now)),
        usage_records::updated_at.eq(now),
    ))
    .execute(conn)?)
}

#[derive(Clone)]
pub struct UsageAggregator {
    pool: DbPool,
    accounts: AccountService,
    source: Arc<dyn ActivitySource>,
}

impl UsageAggregator {
    pub fn new(pool: DbPool, accounts: AccountService, source: Arc<dyn ActivitySource>) -> Self {
        Self {
            pool,
            accounts,
            source,
        }
    }

    /// Aggregates `date` for every active account. Failures for one
    /// organization are recorded and do not stop the run.
    pub async fn calculate_daily_usage(&self, date: NaiveDate) -> Result<UsageRunReport, BillingError> {
        self.source.begin_run(date).await;
        let accounts = self.accounts.list_active_accounts().await?;
        let mut report = UsageRunReport {
            usage_date: Some(date),
            ..Default::default()
        };
        for account in accounts {
            match self.process_account(&account, date).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(
                        "Usage aggregation for organization {} on {} failed: {}",
                        account.organization_id, date, e
                    );
                    report.failed.push((account.organization_id, e.to_string()));
                }
            }
        }
        info!(
            "Usage for {}: {} processed, {} billed, {} allocated, {} skipped, {} failed",
            date,
            report.processed,
            report.billed,
            report.allocated,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    pub async fn run_manual(&self, date: NaiveDate) -> Result<UsageRunReport, BillingError> {
        info!("Manual usage aggregation requested for {}", date);
        self.calculate_daily_usage(date).await
    }

    pub async fn process_account(
        &self,
        account: &BillingAccount,
        date: NaiveDate,
    ) -> Result<UsageOutcome, BillingError> {
        let organization_id = account.organization_id;
        if let Some(existing) = self.get_record(organization_id, date).await? {
            if existing.status != UsageRecordStatus::Pending {
                debug!(
                    "Usage for organization {} on {} already {}",
                    organization_id, date, existing.status
                );
                return Ok(UsageOutcome::Skipped);
            }
        }

        let activity = self.source.daily_activity(organization_id, date).await?;
        let campaign_ids: Vec<i64> = activity.iter().map(|a| a.campaign_id).collect();
        let row_account = account.clone();
        let record = blocking(&self.pool, move |conn| {
            let priced: Vec<Campaign> = campaigns::table
                .filter(campaigns::campaign_id.eq_any(&campaign_ids))
                .filter(campaigns::organization_id.eq(organization_id))
                .select(Campaign::as_select())
                .load(conn)?;
            let totals = compute_usage(&priced, &activity);
            let row = UsageRow {
                organization_id,
                billing_account_id: row_account.billing_account_id,
                usage_date: date,
                clicks: totals.clicks,
                conversions: totals.conversions,
                impressions: totals.impressions,
                advertiser_spend: totals.advertiser_spend,
                affiliate_payout: totals.affiliate_payout,
                platform_revenue: totals.platform_revenue,
                currency: row_account.currency.clone(),
                campaign_breakdown: totals.campaign_breakdown,
                affiliate_breakdown: totals.affiliate_breakdown,
            };
            conn.transaction(|conn| {
                // A record another run already allocated or billed is left alone.
                let Some(pending) = diesel::query_dsl::methods::FilterDsl::filter(
                    diesel::insert_into(usage_records::table)
                        .values(&row)
                        .on_conflict((usage_records::organization_id, usage_records::usage_date))
                        .do_update()
                        .set((&row, usage_records::updated_at.eq(Utc::now()))),
                    usage_records::status.eq(UsageRecordStatus::Pending),
                )
                    .returning(UsageRecord::as_returning())
                    .get_result::<UsageRecord>(conn)
                    .optional()?
                else {
                    return Ok(None);
                };
                let now = Utc::now();
                Ok::<_, BillingError>(
                    diesel::update(
                        usage_records::table
                            .find(pending.usage_record_id)
                            .filter(usage_records::status.eq(UsageRecordStatus::Pending)),
                    )
                    .set((
                        usage_records::status.eq(UsageRecordStatus::Allocated),
                        usage_records::allocated_at.eq(Some(now)),
                        usage_records::updated_at.eq(now),
                    ))
                    .returning(UsageRecord::as_returning())
                    .get_result(conn)
                    .optional()?,
                )
            })
        })
        .await?;

        let Some(record) = record else {
            debug!(
                "Usage for organization {} on {} was taken by a concurrent run",
                organization_id, date
            );
            return Ok(UsageOutcome::Skipped);
        };
        self.bill(account, record).await
    }

    async fn bill(
        &self,
        account: &BillingAccount,
        record: UsageRecord,
    ) -> Result<UsageOutcome, BillingError> {
        let record_id = record.usage_record_id;
        if record.advertiser_spend.is_zero() {
            self.mark_billed(vec![record_id]).await?;
            return Ok(UsageOutcome::Billed);
        }
        if account.billing_mode == BillingMode::Postpaid {
            return Ok(UsageOutcome::Allocated);
        }

        let entry = NewLedgerEntry::new(
            record.organization_id,
            TransactionType::UsageCharge,
            -record.advertiser_spend.clone(),
        )
        .description(format!(
            "Daily usage charge for {}",
            record.usage_date.format("%Y-%m-%d")
        ))
        .reference("usage_record", record_id);

        let charged = blocking(&self.pool, move |conn| {
            conn.transaction(|conn| {
                let txn = append_locked(conn, entry)?;
                mark_billed_locked(conn, &[record_id])?;
                Ok::<_, BillingError>(txn)
            })
        })
        .await;
        match charged {
            Ok(txn) => {
                info!(
                    "Charged organization {} {} for usage record {} (transaction {})",
                    record.organization_id, record.advertiser_spend, record_id, txn.transaction_id
                );
                Ok(UsageOutcome::Billed)
            }
            Err(BillingError::InvalidState(reason)) => {
                warn!(
                    "Usage record {} left allocated for organization {}: {}",
                    record_id, record.organization_id, reason
                );
                Ok(UsageOutcome::Allocated)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mark_billed(&self, ids: Vec<i64>) -> Result<usize, BillingError> {
        blocking(&self.pool, move |conn| mark_billed_locked(conn, &ids)).await
    }

    pub async fn get_record(
        &self,
        organization_id: i64,
        date: NaiveDate,
    ) -> Result<Option<UsageRecord>, BillingError> {
        blocking(&self.pool, move |conn| {
            Ok(usage_records::table
                .filter(usage_records::organization_id.eq(organization_id))
                .filter(usage_records::usage_date.eq(date))
                .select(UsageRecord::as_select())
                .first(conn)
                .optional()?)
        })
        .await
    }
}
