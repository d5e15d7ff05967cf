use log::warn;
use std::sync::Arc;
use std::time::Duration;

use crate::access::{AssociationService, DelegationService, InvitationService};
use crate::billing::{
    AccountService, Ledger, ProviderActivitySource, StripeClient, UsageAggregator, WebhookProcessor,
};
use crate::cache::OpportunisticCache;
use crate::core::config::AppConfig;
use crate::core::shared::utils::DbPool;
use crate::entities::EntityStore;
use crate::provider::reporting::ReportingService;
use crate::provider::{EverflowClient, MappingStore, MirrorReconciler};
use crate::security::CredentialCipher;
use crate::sweepers::SweeperService;

/// Services shared by the HTTP layer and the sweepers.
pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub cache: OpportunisticCache,
    pub entities: EntityStore,
    pub reconciler: MirrorReconciler,
    pub reporting: ReportingService,
    pub invitations: InvitationService,
    pub associations: AssociationService,
    pub delegations: DelegationService,
    pub accounts: AccountService,
    pub ledger: Ledger,
    pub usage: UsageAggregator,
    pub webhooks: WebhookProcessor,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wires every service over one pool. Provider and Stripe clients are
    /// optional; their absence disables the calls that need them.
    pub fn build(config: AppConfig, pool: DbPool) -> anyhow::Result<Self> {
        let cipher = CredentialCipher::new(&config.encryption_key)?;
        let cache = OpportunisticCache::connect(config.cache_url.as_deref());

        let everflow = Arc::new(EverflowClient::new(&config.everflow)?);
        if config.everflow.api_key.is_none() {
            warn!("EVERFLOW_API_KEY not set; provider sync will fail until configured");
        }
        let stripe = StripeClient::from_config(&config.stripe)?.map(Arc::new);
        if stripe.is_none() {
            warn!("STRIPE_SECRET_KEY not set; recharges are recorded without a payment");
        }

        let entities = EntityStore::new(pool.clone());
        let mappings = MappingStore::new(pool.clone(), cipher);
        let reconciler = MirrorReconciler::new(pool.clone(), entities.clone(), mappings.clone())
            .with_client(everflow.clone());
        let reporting = ReportingService::new(everflow, cache.clone());

        let ledger = Ledger::new(pool.clone(), stripe.clone());
        let accounts = AccountService::new(pool.clone(), stripe, cache.clone(), ledger.clone());
        let activity = Arc::new(ProviderActivitySource::new(
            pool.clone(),
            reporting.source(),
            mappings,
        ));
        let usage = UsageAggregator::new(pool.clone(), accounts.clone(), activity);
        let webhooks = WebhookProcessor::new(pool.clone(), config.stripe.webhook_secret.clone());

        Ok(Self {
            invitations: InvitationService::new(pool.clone()),
            associations: AssociationService::new(pool.clone()),
            delegations: DelegationService::new(pool.clone()),
            config,
            conn: pool,
            cache,
            entities,
            reconciler,
            reporting,
            accounts,
            ledger,
            usage,
            webhooks,
        })
    }

    pub fn sweepers(&self) -> SweeperService {
        SweeperService::new(
            self.invitations.clone(),
            self.delegations.clone(),
            self.webhooks.clone(),
            self.usage.clone(),
            self.accounts.clone(),
            self.ledger.clone(),
            Duration::from_secs(self.config.sweep_interval_secs.max(1)),
        )
    }
}
