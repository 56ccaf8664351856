//! Test utilities for database testing.
//!
//! Builds an in-memory SQLite database with migrations applied and wires the
//! slot engine on top of it the same way the server does.

#![allow(dead_code)]

use std::sync::Arc;

use account_slots::config::{AppConfig, SlotPolicyConfig};
use account_slots::models::{binding, slot, transfer_event, transfer_request};
use account_slots::server::AppState;
use account_slots::slots::{ConnectRequest, CredentialBundle, SlotUsage};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

pub const OPERATOR_TOKEN: &str = "test-operator-token";
pub const PROVIDER: &str = "google";
pub const CRYPTO_KEY: [u8; 32] = [7u8; 32];

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Configuration with test keys and the given lifetime quota.
pub fn test_config(default_lifetime_quota: u32) -> AppConfig {
    AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(CRYPTO_KEY.to_vec()),
        transfer_signing_key: Some(vec![9u8; 32]),
        slots: SlotPolicyConfig {
            default_lifetime_quota,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Engine state over a fresh database.
pub async fn setup_state(default_lifetime_quota: u32) -> Result<AppState> {
    let db = setup_test_db().await?;
    AppState::new(Arc::new(test_config(default_lifetime_quota)), db)
}

/// Fixed clock so TTL arithmetic in tests is exact.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn bundle(access: &str, refresh: Option<&str>, label: Option<&str>) -> CredentialBundle {
    CredentialBundle {
        access_token: access.to_string(),
        refresh_token: refresh.map(str::to_string),
        expires_at: None,
        identity_label: label.map(str::to_string),
    }
}

pub fn connect_request(
    owner_id: Uuid,
    external_account_id: &str,
    credentials: CredentialBundle,
) -> ConnectRequest {
    ConnectRequest {
        owner_id,
        provider: PROVIDER.to_string(),
        external_account_id: external_account_id.to_string(),
        plan: None,
        credentials,
        expected_current_owner: None,
    }
}

pub async fn usage(state: &AppState, owner_id: Uuid) -> Result<SlotUsage> {
    let registry = state.guard.binding().registry();
    let limit = registry.quota_for(registry.plan_or_default(None));
    Ok(registry.usage(owner_id, PROVIDER, limit).await?)
}

pub async fn binding_for(
    db: &DatabaseConnection,
    external_account_id: &str,
) -> Result<Option<binding::Model>> {
    Ok(binding::Entity::find()
        .filter(binding::Column::Provider.eq(PROVIDER))
        .filter(binding::Column::ExternalAccountId.eq(external_account_id))
        .one(db)
        .await?)
}

pub async fn slot_for(
    db: &DatabaseConnection,
    external_account_id: &str,
) -> Result<Option<slot::Model>> {
    Ok(slot::Entity::find()
        .filter(slot::Column::Provider.eq(PROVIDER))
        .filter(slot::Column::ExternalAccountId.eq(external_account_id))
        .one(db)
        .await?)
}

pub async fn count_slots(db: &DatabaseConnection) -> Result<u64> {
    Ok(slot::Entity::find().count(db).await?)
}

pub async fn count_bindings(db: &DatabaseConnection) -> Result<u64> {
    Ok(binding::Entity::find().count(db).await?)
}

pub async fn count_events(db: &DatabaseConnection) -> Result<u64> {
    Ok(transfer_event::Entity::find().count(db).await?)
}

pub async fn transfer_request(
    db: &DatabaseConnection,
    id: Uuid,
) -> Result<Option<transfer_request::Model>> {
    Ok(transfer_request::Entity::find_by_id(id).one(db).await?)
}
