#![allow(dead_code)]

use affiliate_backend::core::shared::enums::OrganizationType;
use affiliate_backend::core::shared::utils::{create_conn, run_migrations, DbPool};
use affiliate_backend::entities::{EntityStore, NewOrganization, Organization};
use affiliate_backend::security::CredentialCipher;
use uuid::Uuid;

/// Pool against `DATABASE_URL` with migrations applied, or `None` when no
/// database is reachable.
pub fn test_pool() -> Option<DbPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = match create_conn(&url, 8) {
        Ok(pool) => pool,
        Err(e) => {
            println!("Skipping test - cannot connect to database: {}", e);
            return None;
        }
    };
    if let Err(e) = run_migrations(&pool) {
        println!("Skipping test - migrations failed: {}", e);
        return None;
    }
    Some(pool)
}

pub fn test_cipher() -> CredentialCipher {
    CredentialCipher::new(&[7u8; 32]).unwrap()
}

pub async fn organization(store: &EntityStore, org_type: OrganizationType) -> Organization {
    store
        .create_organization(NewOrganization {
            name: format!("{} {}", org_type, Uuid::new_v4()),
            org_type,
        })
        .await
        .unwrap()
}
