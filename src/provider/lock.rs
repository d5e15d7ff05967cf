//! Session-level Postgres advisory lock serialising sync of one
//! `(kind, provider, entity)` triple across processes.

use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::sql_types::{BigInt, Bool};
use diesel::{sql_query, PgConnection, QueryableByName, RunQueryDsl};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::Instant;

use super::MirrorError;
use crate::core::shared::enums::ProviderType;
use crate::core::shared::utils::DbPool;
use crate::entities::EntityKind;

type PooledPg = PooledConnection<ConnectionManager<PgConnection>>;

const FIRST_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
const WAIT_LIMIT: Duration = Duration::from_secs(120);

#[derive(QueryableByName)]
struct TryLock {
    #[diesel(sql_type = Bool)]
    acquired: bool,
}

/// Takes a connection and tries the lock once. The connection goes back to
/// the pool when the lock is held elsewhere.
fn try_lock(pool: &DbPool, key: i64) -> Result<Option<PooledPg>, MirrorError> {
    let mut conn = pool.get()?;
    let row: TryLock = sql_query("SELECT pg_try_advisory_lock($1) AS acquired")
        .bind::<BigInt, _>(key)
        .get_result(&mut conn)?;
    Ok(row.acquired.then_some(conn))
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// First eight bytes of SHA-256 over `kind:provider:entity_id`.
pub fn lock_key(kind: EntityKind, provider_type: ProviderType, entity_id: i64) -> i64 {
    let digest = Sha256::digest(format!("{}:{}:{}", kind, provider_type, entity_id).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Holds a dedicated pooled connection for as long as the lock is held.
/// Advisory locks belong to the session, so the same connection must unlock.
/// Waiters poll without keeping a connection checked out.
pub struct MirrorLock {
    key: i64,
    conn: Option<PooledPg>,
}

impl MirrorLock {
    pub async fn acquire(
        pool: &DbPool,
        kind: EntityKind,
        provider_type: ProviderType,
        entity_id: i64,
    ) -> Result<Self, MirrorError> {
        let key = lock_key(kind, provider_type, entity_id);
        let started = Instant::now();
        let mut backoff = FIRST_BACKOFF;
        loop {
            let attempt_pool = pool.clone();
            let held = tokio::task::spawn_blocking(move || try_lock(&attempt_pool, key)).await??;
            if let Some(conn) = held {
                debug!("Acquired mirror lock {} for {} {}", key, kind, entity_id);
                return Ok(Self {
                    key,
                    conn: Some(conn),
                });
            }
            if started.elapsed() >= WAIT_LIMIT {
                return Err(MirrorError::Conflict(format!(
                    "{} {} is being synced elsewhere",
                    kind, entity_id
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    pub async fn release(mut self) -> Result<(), MirrorError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let key = self.key;
        tokio::task::spawn_blocking(move || unlock(conn, key)).await??;
        Ok(())
    }
}

fn unlock(mut conn: PooledPg, key: i64) -> Result<(), MirrorError> {
    sql_query("SELECT pg_advisory_unlock($1)")
        .bind::<BigInt, _>(key)
        .execute(&mut conn)?;
    Ok(())
}

impl Drop for MirrorLock {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let key = self.key;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    if let Err(e) = unlock(conn, key) {
                        warn!("Failed to release mirror lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = unlock(conn, key) {
                    warn!("Failed to release mirror lock {}: {}", key, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable_and_distinct() {
        let a = lock_key(EntityKind::Campaign, ProviderType::Everflow, 12);
        assert_eq!(a, lock_key(EntityKind::Campaign, ProviderType::Everflow, 12));
        assert_ne!(a, lock_key(EntityKind::Advertiser, ProviderType::Everflow, 12));
        assert_ne!(a, lock_key(EntityKind::Campaign, ProviderType::Everflow, 13));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = FIRST_BACKOFF;
        for _ in 0..20 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
        assert_eq!(next_backoff(FIRST_BACKOFF), Duration::from_millis(40));
    }
}
