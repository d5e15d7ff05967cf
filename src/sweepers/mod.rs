//! Background maintenance: invitation and delegation expiry, webhook retry,
//! daily usage aggregation and ledger balance audits.

use chrono::{Duration as ChronoDuration, Utc};
use cron::Schedule;
use log::{debug, error, info, warn};
use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use crate::access::{DelegationService, InvitationService};
use crate::billing::{AccountService, Ledger, UsageAggregator, WebhookProcessor};

pub const DAILY_USAGE_CRON: &str = "0 0 0 * * *";
const WEBHOOK_RETRY_PERIOD: Duration = Duration::from_secs(60);
const WEBHOOK_RETRY_BATCH: i64 = 100;
const BALANCE_AUDIT_PERIOD: Duration = Duration::from_secs(3600);
const DAILY_USAGE_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Runs `job` under `deadline`, logging failures and timeouts.
async fn run_bounded<F, T, E>(name: &str, deadline: Duration, job: F)
where
    F: Future<Output = Result<T, E>>,
    T: std::fmt::Debug,
    E: Display,
{
    match timeout(deadline, job).await {
        Ok(Ok(result)) => debug!("Sweeper {} finished: {:?}", name, result),
        Ok(Err(e)) => error!("Sweeper {} failed: {}", name, e),
        Err(_) => warn!("Sweeper {} exceeded its {:?} deadline", name, deadline),
    }
}

/// Ticks every `period` until shutdown. The first tick fires immediately.
fn spawn_periodic<F, Fut, T, E>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    T: std::fmt::Debug,
    E: Display,
{
    tokio::spawn(async move {
        info!("Sweeper {} started (every {:?})", name, period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => run_bounded(name, period, job()).await,
                _ = shutdown.changed() => break,
            }
        }
        info!("Sweeper {} stopped", name);
    })
}

/// Time until the next firing of `schedule`, measured from now.
pub fn until_next(schedule: &Schedule) -> Option<Duration> {
    let next = schedule.upcoming(Utc).next()?;
    (next - Utc::now()).to_std().ok()
}

#[derive(Clone)]
pub struct SweeperService {
    invitations: InvitationService,
    delegations: DelegationService,
    webhooks: WebhookProcessor,
    usage: UsageAggregator,
    accounts: AccountService,
    ledger: Ledger,
    sweep_interval: Duration,
}

impl SweeperService {
    pub fn new(
        invitations: InvitationService,
        delegations: DelegationService,
        webhooks: WebhookProcessor,
        usage: UsageAggregator,
        accounts: AccountService,
        ledger: Ledger,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            invitations,
            delegations,
            webhooks,
            usage,
            accounts,
            ledger,
            sweep_interval,
        }
    }

    /// Starts every sweeper; they exit once `shutdown` flips.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let invitations = self.invitations.clone();
        handles.push(spawn_periodic(
            "invitation-expiry",
            self.sweep_interval,
            shutdown.clone(),
            move || {
                let invitations = invitations.clone();
                async move { invitations.expire_invitations().await }
            },
        ));

        let delegations = self.delegations.clone();
        handles.push(spawn_periodic(
            "delegation-expiry",
            self.sweep_interval,
            shutdown.clone(),
            move || {
                let delegations = delegations.clone();
                async move { delegations.expire_delegations().await }
            },
        ));

        let webhooks = self.webhooks.clone();
        handles.push(spawn_periodic(
            "webhook-retry",
            WEBHOOK_RETRY_PERIOD,
            shutdown.clone(),
            move || {
                let webhooks = webhooks.clone();
                async move { webhooks.retry_pending(WEBHOOK_RETRY_BATCH).await }
            },
        ));

        let service = self.clone();
        handles.push(spawn_periodic(
            "balance-audit",
            BALANCE_AUDIT_PERIOD,
            shutdown.clone(),
            move || {
                let service = service.clone();
                async move { service.audit_balances().await }
            },
        ));

        handles.push(self.spawn_daily_usage(shutdown));
        handles
    }

    fn spawn_daily_usage(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let usage = self.usage.clone();
        tokio::spawn(async move {
            let schedule = match Schedule::from_str(DAILY_USAGE_CRON) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!("Invalid daily usage schedule {}: {}", DAILY_USAGE_CRON, e);
                    return;
                }
            };
            info!("Sweeper daily-usage started ({})", DAILY_USAGE_CRON);
            loop {
                let Some(wait) = until_next(&schedule) else {
                    warn!("Daily usage schedule has no upcoming run");
                    break;
                };
                tokio::select! {
                    _ = sleep(wait) => {
                        let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);
                        run_bounded(
                            "daily-usage",
                            DAILY_USAGE_DEADLINE,
                            usage.calculate_daily_usage(yesterday),
                        )
                        .await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Sweeper daily-usage stopped");
        })
    }

    /// Audits every active account; returns how many were inconsistent.
    pub async fn audit_balances(&self) -> Result<usize, crate::billing::BillingError> {
        let accounts = self.accounts.list_active_accounts().await?;
        let mut inconsistent = 0;
        for account in &accounts {
            match self.ledger.audit_balance(account.billing_account_id).await {
                Ok(audit) if audit.consistent => {}
                Ok(audit) => {
                    inconsistent += 1;
                    error!(
                        "Balance mismatch on account {} (organization {}): stored {} ledger {} last {:?}",
                        audit.billing_account_id,
                        account.organization_id,
                        audit.stored,
                        audit.ledger_sum,
                        audit.last_balance_after
                    );
                }
                Err(e) => warn!(
                    "Balance audit failed for account {}: {}",
                    account.billing_account_id, e
                ),
            }
        }
        if inconsistent == 0 {
            debug!("Balance audit passed for {} account(s)", accounts.len());
        }
        Ok(inconsistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_daily_schedule_fires_at_midnight() {
        let schedule = Schedule::from_str(DAILY_USAGE_CRON).unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "00:00:00");
        let wait = until_next(&schedule).unwrap();
        assert!(wait <= Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_periodic_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_millis(10), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        });
        sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_run_bounded_times_out() {
        run_bounded("slow", Duration::from_millis(5), async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, String>(())
        })
        .await;
    }
}
