use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::everflow::{ProviderClient, ProviderError, ProviderRecord};
use super::lock::MirrorLock;
use super::mappers::{apply_record, provider_id_from, reference_label, request_body};
use super::{MappingStore, MirrorError, ProviderMapping};
use crate::core::shared::enums::{ProviderType, SyncStatus};
use crate::core::shared::utils::DbPool;
use crate::entities::{EntityKind, EntityStore, MirroredEntity};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "mapping", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(ProviderMapping),
    /// Drafts stay local; the mapping is left `unsynced`.
    Suppressed(ProviderMapping),
}

impl SyncOutcome {
    pub fn mapping(&self) -> &ProviderMapping {
        match self {
            Self::Synced(m) | Self::Suppressed(m) => m,
        }
    }
}

/// Result of pulling provider state onto the local row.
#[derive(Debug, Clone, Serialize)]
pub struct EntityPatch {
    pub kind: EntityKind,
    pub entity_id: i64,
    pub changed_fields: Vec<&'static str>,
    pub entity: MirroredEntity,
}

type SyncFuture<'a> = Pin<Box<dyn Future<Output = Result<SyncOutcome, MirrorError>> + Send + 'a>>;

#[derive(Clone)]
pub struct MirrorReconciler {
    pool: DbPool,
    entities: EntityStore,
    mappings: MappingStore,
    clients: HashMap<ProviderType, Arc<dyn ProviderClient>>,
}

impl MirrorReconciler {
    pub fn new(pool: DbPool, entities: EntityStore, mappings: MappingStore) -> Self {
        Self {
            pool,
            entities,
            mappings,
            clients: HashMap::new(),
        }
    }

    pub fn with_client(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.provider_type(), client);
        self
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    fn client(&self, provider_type: ProviderType) -> Result<Arc<dyn ProviderClient>, MirrorError> {
        self.clients
            .get(&provider_type)
            .cloned()
            .ok_or_else(|| MirrorError::InvalidState(format!("no client for {}", provider_type)))
    }

    /// Idempotent upsert of the entity on the provider.
    pub async fn ensure_synced(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<SyncOutcome, MirrorError> {
        let client = self.client(provider_type)?;
        let entity = self.entities.load_mirrored(kind, entity_id).await?;

        if entity.status().suppresses_sync() {
            let mapping = self
                .mappings
                .get_or_create(kind, entity_id, provider_type)
                .await?;
            info!("Skipping provider sync of draft {} {}", kind, entity_id);
            return Ok(SyncOutcome::Suppressed(mapping));
        }

        let parents = self.sync_parents(&entity, provider_type).await?;

        let lock = MirrorLock::acquire(&self.pool, kind, provider_type, entity_id).await?;
        let result = self.push_locked(client.as_ref(), &entity, &parents).await;
        if let Err(e) = lock.release().await {
            warn!("Mirror lock release failed for {} {}: {}", kind, entity_id, e);
        }
        result.map(SyncOutcome::Synced)
    }

    pub async fn push_to_provider(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<ProviderMapping, MirrorError> {
        match self.ensure_synced(kind, entity_id, provider_type).await? {
            SyncOutcome::Synced(mapping) => Ok(mapping),
            SyncOutcome::Suppressed(_) => Err(MirrorError::InvalidState(format!(
                "{} {} is a draft and is not pushed",
                kind, entity_id
            ))),
        }
    }

    /// Reads the provider row and copies mirrored fields onto the local entity.
    /// Holds the same lock as `ensure_synced` for the key.
    pub async fn pull_from_provider(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<EntityPatch, MirrorError> {
        let client = self.client(provider_type)?;
        let lock = MirrorLock::acquire(&self.pool, kind, provider_type, entity_id).await?;
        let result = self
            .pull_locked(client.as_ref(), kind, entity_id, provider_type)
            .await;
        if let Err(e) = lock.release().await {
            warn!("Mirror lock release failed for {} {}: {}", kind, entity_id, e);
        }
        result
    }

    async fn pull_locked(
        &self,
        client: &dyn ProviderClient,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<EntityPatch, MirrorError> {
        let mapping = self
            .mappings
            .get(kind, entity_id, provider_type)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("no {} mapping for {} {}", provider_type, kind, entity_id)))?;
        let provider_id = mapping.provider_entity_id.clone().ok_or_else(|| {
            MirrorError::InvalidState(format!("{} {} has not been mirrored yet", kind, entity_id))
        })?;

        let mut entity = self.entities.load_mirrored(kind, entity_id).await?;
        let fetched = match kind {
            EntityKind::TrackingLink => {
                let parents = self.known_parent_ids(&entity, provider_type).await?;
                let body = request_body(&entity, &parents).map_err(MirrorError::InvalidState)?;
                client.update(kind, &provider_id, &body).await.map(Some)
            }
            _ => client.fetch(kind, &provider_id).await,
        };
        let record = match fetched {
            Ok(Some(record)) => record,
            Ok(None) => {
                let message = format!("{} {} no longer exists on {}", kind, provider_id, provider_type);
                self.mappings
                    .record_failure(kind, mapping.mapping_id, &message)
                    .await?;
                return Err(MirrorError::NotFound(message));
            }
            Err(e) => {
                self.mappings
                    .record_failure(kind, mapping.mapping_id, &e.provider_message())
                    .await?;
                return Err(e.into());
            }
        };

        let changed_fields = apply_record(&mut entity, &record);
        if !changed_fields.is_empty() {
            entity = self.entities.save_mirrored(entity).await?;
            info!(
                "Pulled {} {} from {}: {}",
                kind,
                entity_id,
                provider_type,
                changed_fields.join(", ")
            );
        }
        self.mappings
            .record_success(kind, mapping.mapping_id, None, Some(record))
            .await?;

        Ok(EntityPatch {
            kind,
            entity_id,
            changed_fields,
            entity,
        })
    }

    pub async fn mark_error(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        message: &str,
    ) -> Result<ProviderMapping, MirrorError> {
        self.mappings.record_failure(kind, mapping_id, message).await
    }

    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        mapping_id: i64,
    ) -> Result<ProviderMapping, MirrorError> {
        self.mappings
            .record_success(kind, mapping_id, None, None)
            .await
    }

    fn sync_parent(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> SyncFuture<'_> {
        Box::pin(self.ensure_synced(kind, entity_id, provider_type))
    }

    /// Parents must exist on the provider first. A draft or failing parent
    /// blocks the child.
    async fn sync_parents(
        &self,
        entity: &MirroredEntity,
        provider_type: ProviderType,
    ) -> Result<HashMap<EntityKind, String>, MirrorError> {
        let mut ids = HashMap::new();
        for (parent_kind, parent_id) in entity.parents() {
            let outcome = self
                .sync_parent(parent_kind, parent_id, provider_type)
                .await
                .map_err(|e| {
                    MirrorError::InvalidState(format!(
                        "parent {} {} failed to sync: {}",
                        parent_kind, parent_id, e
                    ))
                })?;
            let mapping = match outcome {
                SyncOutcome::Synced(mapping) => mapping,
                SyncOutcome::Suppressed(_) => {
                    return Err(MirrorError::InvalidState(format!(
                        "parent {} {} is a draft",
                        parent_kind, parent_id
                    )))
                }
            };
            let provider_id = mapping.provider_entity_id.ok_or_else(|| {
                MirrorError::InvalidState(format!(
                    "parent {} {} has no provider id",
                    parent_kind, parent_id
                ))
            })?;
            ids.insert(parent_kind, provider_id);
        }
        Ok(ids)
    }

    async fn known_parent_ids(
        &self,
        entity: &MirroredEntity,
        provider_type: ProviderType,
    ) -> Result<HashMap<EntityKind, String>, MirrorError> {
        let mut ids = HashMap::new();
        for (parent_kind, parent_id) in entity.parents() {
            let provider_id = self
                .mappings
                .get(parent_kind, parent_id, provider_type)
                .await?
                .and_then(|m| m.provider_entity_id)
                .ok_or_else(|| {
                    MirrorError::InvalidState(format!(
                        "parent {} {} has no provider id",
                        parent_kind, parent_id
                    ))
                })?;
            ids.insert(parent_kind, provider_id);
        }
        Ok(ids)
    }

    async fn push_locked(
        &self,
        client: &dyn ProviderClient,
        entity: &MirroredEntity,
        parents: &HashMap<EntityKind, String>,
    ) -> Result<ProviderMapping, MirrorError> {
        let kind = entity.kind();
        let entity_id = entity.id();
        let mapping = self
            .mappings
            .get_or_create(kind, entity_id, client.provider_type())
            .await?;
        let mapping = self.mappings.mark_pending(kind, mapping.mapping_id).await?;

        let body = match request_body(entity, parents) {
            Ok(body) => body,
            Err(message) => {
                self.mappings
                    .record_failure(kind, mapping.mapping_id, &message)
                    .await?;
                return Err(MirrorError::InvalidState(message));
            }
        };

        match self.call_provider(client, entity, &mapping, &body).await {
            Ok((provider_id, record)) => {
                let updated = self
                    .mappings
                    .record_success(kind, mapping.mapping_id, provider_id, Some(record.clone()))
                    .await?;
                if kind == EntityKind::TrackingLink {
                    self.adopt_generated_url(entity.clone(), &record).await;
                }
                info!(
                    "Synced {} {} to {} as {}",
                    kind,
                    entity_id,
                    client.provider_type(),
                    updated.provider_entity_id.as_deref().unwrap_or("-")
                );
                Ok(updated)
            }
            Err(e) => {
                let message = e.provider_message();
                warn!(
                    "Sync of {} {} to {} failed: {}",
                    kind,
                    entity_id,
                    client.provider_type(),
                    message
                );
                self.mappings
                    .record_failure(kind, mapping.mapping_id, &message)
                    .await?;
                Err(MirrorError::Provider(e))
            }
        }
    }

    /// Create, recover or update. Returns the provider id learned on this
    /// call (if any) and the record the provider returned.
    async fn call_provider(
        &self,
        client: &dyn ProviderClient,
        entity: &MirroredEntity,
        mapping: &ProviderMapping,
        body: &Value,
    ) -> Result<(Option<String>, ProviderRecord), ProviderError> {
        let kind = entity.kind();

        if let Some(provider_id) = mapping.provider_entity_id.as_deref() {
            let record = client.update(kind, provider_id, body).await?;
            return Ok((provider_id_from(kind, &record, body), record));
        }

        let reference = reference_label(kind, entity.id());
        if let Some(found) = client.find_by_reference(kind, &reference).await? {
            if let Some(provider_id) = provider_id_from(kind, &found, body) {
                info!(
                    "Recovered {} {} on {} as {} by reference",
                    kind,
                    entity.id(),
                    client.provider_type(),
                    provider_id
                );
                let record = client.update(kind, &provider_id, body).await?;
                return Ok((Some(provider_id), record));
            }
        }

        let record = client.create(kind, body).await?;
        let provider_id = provider_id_from(kind, &record, body).ok_or_else(|| {
            ProviderError::Parse(format!("create response for {} carries no id", kind))
        })?;
        Ok((Some(provider_id), record))
    }

    async fn adopt_generated_url(&self, mut entity: MirroredEntity, record: &Value) {
        if apply_record(&mut entity, record).is_empty() {
            return;
        }
        let id = entity.id();
        if let Err(e) = self.entities.save_mirrored(entity).await {
            warn!("Could not store generated tracking URL for link {}: {}", id, e);
        }
    }

    /// Current sync state for every mapping of an entity.
    pub async fn status(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<(ProviderType, SyncStatus, Option<String>)>, MirrorError> {
        Ok(self
            .mappings
            .list_for_entity(kind, entity_id)
            .await?
            .into_iter()
            .map(|m| (m.provider_type, m.sync_status, m.sync_error))
            .collect())
    }
}
