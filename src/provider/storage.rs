use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Jsonb, Text};
use log::debug;

use super::{MirrorError, ProviderMapping};
use crate::core::shared::enums::ProviderType;
use crate::core::shared::utils::{blocking, DbPool};
use crate::entities::EntityKind;
use crate::security::CredentialCipher;

const COLUMNS: &str = "mapping_id, entity_id, provider_type, provider_entity_id, api_credentials, \
     provider_config, provider_data, sync_status, last_sync_at, sync_error, created_at, updated_at";

/// Mapping table for an entity kind. Table names never come from input.
pub fn mapping_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Advertiser => "advertiser_provider_mappings",
        EntityKind::Affiliate => "affiliate_provider_mappings",
        EntityKind::Campaign => "campaign_provider_mappings",
        EntityKind::TrackingLink => "tracking_link_provider_mappings",
    }
}

pub fn load_for_entity(
    conn: &mut PgConnection,
    kind: EntityKind,
    entity_id: i64,
) -> QueryResult<Vec<ProviderMapping>> {
    sql_query(format!(
        "SELECT {COLUMNS} FROM {} WHERE entity_id = $1 ORDER BY provider_type",
        mapping_table(kind)
    ))
    .bind::<BigInt, _>(entity_id)
    .load::<ProviderMapping>(conn)
}

fn select_one(
    conn: &mut PgConnection,
    kind: EntityKind,
    entity_id: i64,
    provider_type: ProviderType,
) -> QueryResult<Option<ProviderMapping>> {
    sql_query(format!(
        "SELECT {COLUMNS} FROM {} WHERE entity_id = $1 AND provider_type = $2",
        mapping_table(kind)
    ))
    .bind::<BigInt, _>(entity_id)
    .bind::<Text, _>(provider_type.as_str())
    .get_result::<ProviderMapping>(conn)
    .optional()
}

fn select_by_id(
    conn: &mut PgConnection,
    kind: EntityKind,
    mapping_id: i64,
) -> Result<ProviderMapping, MirrorError> {
    sql_query(format!(
        "SELECT {COLUMNS} FROM {} WHERE mapping_id = $1",
        mapping_table(kind)
    ))
    .bind::<BigInt, _>(mapping_id)
    .get_result::<ProviderMapping>(conn)
    .optional()?
    .ok_or_else(|| MirrorError::NotFound(format!("{} mapping {}", kind, mapping_id)))
}

/// One store over the four per-kind mapping tables.
#[derive(Clone)]
pub struct MappingStore {
    pool: DbPool,
    cipher: CredentialCipher,
}

impl MappingStore {
    pub fn new(pool: DbPool, cipher: CredentialCipher) -> Self {
        Self { pool, cipher }
    }

    pub async fn get(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<Option<ProviderMapping>, MirrorError> {
        blocking(&self.pool, move |conn| {
            Ok(select_one(conn, kind, entity_id, provider_type)?)
        })
        .await
    }

    /// Returns the mapping for the pair, inserting an `unsynced` row when none exists.
    pub async fn get_or_create(
        &self,
        kind: EntityKind,
        entity_id: i64,
        provider_type: ProviderType,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| {
            let inserted = sql_query(format!(
                "INSERT INTO {} (entity_id, provider_type) VALUES ($1, $2) \
                 ON CONFLICT (entity_id, provider_type) DO NOTHING",
                mapping_table(kind)
            ))
            .bind::<BigInt, _>(entity_id)
            .bind::<Text, _>(provider_type.as_str())
            .execute(conn)?;
            if inserted > 0 {
                debug!("Created {} mapping for {} {}", provider_type, kind, entity_id);
            }
            select_one(conn, kind, entity_id, provider_type)?.ok_or_else(|| {
                MirrorError::Internal(format!("{} mapping for {} vanished", kind, entity_id))
            })
        })
        .await
    }

    pub async fn get_by_id(
        &self,
        kind: EntityKind,
        mapping_id: i64,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| select_by_id(conn, kind, mapping_id)).await
    }

    pub async fn list_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<ProviderMapping>, MirrorError> {
        blocking(&self.pool, move |conn| Ok(load_for_entity(conn, kind, entity_id)?)).await
    }

    pub async fn mark_pending(
        &self,
        kind: EntityKind,
        mapping_id: i64,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| {
            sql_query(format!(
                "UPDATE {} SET sync_status = 'pending', updated_at = NOW() \
                 WHERE mapping_id = $1 RETURNING {COLUMNS}",
                mapping_table(kind)
            ))
            .bind::<BigInt, _>(mapping_id)
            .get_result::<ProviderMapping>(conn)
            .optional()?
            .ok_or_else(|| MirrorError::NotFound(format!("{} mapping {}", kind, mapping_id)))
        })
        .await
    }

    /// `provider_entity_id` only moves forward: a `None` keeps the stored id.
    pub async fn record_success(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        provider_entity_id: Option<String>,
        provider_data: Option<serde_json::Value>,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| {
            sql_query(format!(
                "UPDATE {} SET sync_status = 'synced', sync_error = NULL, last_sync_at = NOW(), \
                 provider_entity_id = COALESCE($2, provider_entity_id), \
                 provider_data = COALESCE($3, provider_data), updated_at = NOW() \
                 WHERE mapping_id = $1 RETURNING {COLUMNS}",
                mapping_table(kind)
            ))
            .bind::<BigInt, _>(mapping_id)
            .bind::<diesel::sql_types::Nullable<Text>, _>(provider_entity_id)
            .bind::<diesel::sql_types::Nullable<Jsonb>, _>(provider_data)
            .get_result::<ProviderMapping>(conn)
            .optional()?
            .ok_or_else(|| MirrorError::NotFound(format!("{} mapping {}", kind, mapping_id)))
        })
        .await
    }

    /// Keeps any provider id already learned.
    pub async fn record_failure(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        message: &str,
    ) -> Result<ProviderMapping, MirrorError> {
        self.set_text_column(
            kind,
            mapping_id,
            "sync_status = 'error', sync_error = $2, last_sync_at = NOW()",
            message.to_string(),
        )
        .await
    }

    pub async fn set_config(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        config: serde_json::Value,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| {
            sql_query(format!(
                "UPDATE {} SET provider_config = $2, updated_at = NOW() \
                 WHERE mapping_id = $1 RETURNING {COLUMNS}",
                mapping_table(kind)
            ))
            .bind::<BigInt, _>(mapping_id)
            .bind::<Jsonb, _>(config)
            .get_result::<ProviderMapping>(conn)
            .optional()?
            .ok_or_else(|| MirrorError::NotFound(format!("{} mapping {}", kind, mapping_id)))
        })
        .await
    }

    /// Encrypts `plaintext` before it reaches the database.
    pub async fn set_credentials(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        plaintext: &str,
    ) -> Result<ProviderMapping, MirrorError> {
        let sealed = self
            .cipher
            .encrypt(plaintext)
            .map_err(|e| MirrorError::Internal(e.to_string()))?;
        self.set_text_column(kind, mapping_id, "api_credentials = $2", sealed)
            .await
    }

    pub async fn credentials(
        &self,
        kind: EntityKind,
        mapping_id: i64,
    ) -> Result<Option<String>, MirrorError> {
        let mapping = self.get_by_id(kind, mapping_id).await?;
        mapping
            .api_credentials
            .map(|sealed| {
                self.cipher
                    .decrypt(&sealed)
                    .map_err(|e| MirrorError::Internal(format!("credentials unreadable: {}", e)))
            })
            .transpose()
    }

    pub async fn find_entity_by_provider_id(
        &self,
        kind: EntityKind,
        provider_type: ProviderType,
        provider_entity_id: &str,
    ) -> Result<Option<ProviderMapping>, MirrorError> {
        let provider_entity_id = provider_entity_id.to_string();
        blocking(&self.pool, move |conn| {
            Ok(sql_query(format!(
                "SELECT {COLUMNS} FROM {} WHERE provider_type = $1 AND provider_entity_id = $2 \
                 ORDER BY mapping_id LIMIT 1",
                mapping_table(kind)
            ))
            .bind::<Text, _>(provider_type.as_str())
            .bind::<Text, _>(provider_entity_id)
            .get_result::<ProviderMapping>(conn)
            .optional()?)
        })
        .await
    }

    async fn set_text_column(
        &self,
        kind: EntityKind,
        mapping_id: i64,
        assignments: &'static str,
        value: String,
    ) -> Result<ProviderMapping, MirrorError> {
        blocking(&self.pool, move |conn| {
            sql_query(format!(
                "UPDATE {} SET {assignments}, updated_at = NOW() \
                 WHERE mapping_id = $1 RETURNING {COLUMNS}",
                mapping_table(kind)
            ))
            .bind::<BigInt, _>(mapping_id)
            .bind::<Text, _>(value)
            .get_result::<ProviderMapping>(conn)
            .optional()?
            .ok_or_else(|| MirrorError::NotFound(format!("{} mapping {}", kind, mapping_id)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_its_own_table() {
        let tables: std::collections::HashSet<_> =
            EntityKind::ALL.iter().map(|k| mapping_table(*k)).collect();
        assert_eq!(tables.len(), 4);
        assert_eq!(mapping_table(EntityKind::TrackingLink), "tracking_link_provider_mappings");
    }
}
