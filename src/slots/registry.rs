//! SlotRegistry: the lifetime slot ledger per (owner, provider).
//!
//! Historical and active usage are derived from slot rows on every read; no
//! counter column exists that could drift from the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection};
use tracing::{debug, info};
use uuid::Uuid;

use super::{SlotUsage, normalize_external_account_id};
use crate::config::{DEFAULT_PLAN, SlotPolicyConfig};
use crate::error::SlotError;
use crate::models::slot;
use crate::repositories::{NewSlot, SlotRepository};

/// A connection attempt asking for a slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotClaim<'a> {
    pub owner_id: Uuid,
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub external_identity_label: Option<&'a str>,
    pub plan: &'a str,
    pub quota_limit: u32,
}

/// Outcome of slot resolution.
#[derive(Debug, Clone)]
pub struct SlotResolution {
    pub slot: slot::Model,
    /// True when an existing slot was reused (reconnect)
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct SlotRegistry {
    db: Arc<DatabaseConnection>,
    policy: SlotPolicyConfig,
}

impl SlotRegistry {
    pub fn new(db: Arc<DatabaseConnection>, policy: SlotPolicyConfig) -> Self {
        Self { db, policy }
    }

    /// Plan name to record, defaulting when the caller gave none
    pub fn plan_or_default<'a>(&self, plan: Option<&'a str>) -> &'a str {
        plan.map(str::trim)
            .filter(|plan| !plan.is_empty())
            .unwrap_or(DEFAULT_PLAN)
    }

    /// Lifetime quota for a plan
    pub fn quota_for(&self, plan: &str) -> u32 {
        self.policy.quota_for(plan)
    }

    /// Returns the owner's existing slot for the identity, or allocates a new one.
    ///
    /// An existing slot is returned regardless of quota usage and reactivated
    /// if it was disconnected. A new slot is only allocated while the owner's
    /// historical count is below `quota_limit`.
    pub async fn resolve_or_create<C: ConnectionTrait>(
        &self,
        conn: &C,
        claim: SlotClaim<'_>,
        now: DateTime<Utc>,
    ) -> Result<SlotResolution, SlotError> {
        let external_account_id = normalize_external_account_id(claim.external_account_id)?;

        if let Some(existing) = SlotRepository::find_for_owner_identity(
            conn,
            claim.owner_id,
            claim.provider,
            &external_account_id,
        )
        .await?
        {
            if !existing.is_active || claim.external_identity_label.is_some() {
                self.reactivate(conn, existing.id, claim.external_identity_label)
                    .await?;
            }
            debug!(
                owner_id = %claim.owner_id,
                provider = claim.provider,
                slot_id = %existing.id,
                sequence_number = existing.sequence_number,
                "Reusing existing slot"
            );
            let slot = SlotRepository::lock_by_id(conn, existing.id)
                .await?
                .unwrap_or(existing);
            return Ok(SlotResolution { slot, reused: true });
        }

        let historical =
            SlotRepository::count_historical(conn, claim.owner_id, claim.provider).await?;
        if historical >= u64::from(claim.quota_limit) {
            info!(
                owner_id = %claim.owner_id,
                provider = claim.provider,
                historical,
                limit = claim.quota_limit,
                "Lifetime slot quota exhausted"
            );
            return Err(SlotError::QuotaExceeded {
                provider: claim.provider.to_string(),
                limit: claim.quota_limit,
                historical,
            });
        }

        // Concurrent allocations collide on (origin_owner_id, provider, sequence_number)
        let sequence_number = SlotRepository::max_sequence(conn, claim.owner_id, claim.provider)
            .await?
            .unwrap_or(0)
            + 1;

        let slot = SlotRepository::insert(
            conn,
            NewSlot {
                owner_id: claim.owner_id,
                provider: claim.provider,
                external_account_id: &external_account_id,
                external_identity_label: claim.external_identity_label,
                sequence_number,
                plan: claim.plan,
            },
            now,
        )
        .await?;

        info!(
            owner_id = %claim.owner_id,
            provider = claim.provider,
            slot_id = %slot.id,
            sequence_number,
            plan = claim.plan,
            "Allocated new lifetime slot"
        );

        Ok(SlotResolution {
            slot,
            reused: false,
        })
    }

    /// Sets `is_active` and clears `deactivated_at`. Never touches the
    /// sequence number or owner.
    pub async fn reactivate<C: ConnectionTrait>(
        &self,
        conn: &C,
        slot_id: Uuid,
        label: Option<&str>,
    ) -> Result<(), SlotError> {
        SlotRepository::reactivate(conn, slot_id, label).await?;
        Ok(())
    }

    /// Clears `is_active` and stamps `deactivated_at`.
    pub async fn deactivate<C: ConnectionTrait>(
        &self,
        conn: &C,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), SlotError> {
        SlotRepository::deactivate(conn, slot_id, now).await?;
        Ok(())
    }

    /// Historical and active usage for an owner and provider
    pub async fn usage(
        &self,
        owner_id: Uuid,
        provider: &str,
        quota_limit: u32,
    ) -> Result<SlotUsage, SlotError> {
        let historical = SlotRepository::count_historical(&*self.db, owner_id, provider).await?;
        let active = SlotRepository::count_active(&*self.db, owner_id, provider).await?;
        Ok(SlotUsage::new(historical, active, quota_limit))
    }

    /// Every slot an owner currently holds
    pub async fn list_for_owner(&self, owner_id: Uuid) -> Result<Vec<slot::Model>, SlotError> {
        Ok(SlotRepository::list_for_owner(&*self.db, owner_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn registry_with(policy: SlotPolicyConfig) -> SlotRegistry {
        SlotRegistry::new(Arc::new(DatabaseConnection::Disconnected), policy)
    }

    #[test]
    fn plan_defaults_when_missing_or_blank() {
        let registry = registry_with(SlotPolicyConfig::default());
        assert_eq!(registry.plan_or_default(None), DEFAULT_PLAN);
        assert_eq!(registry.plan_or_default(Some("  ")), DEFAULT_PLAN);
        assert_eq!(registry.plan_or_default(Some(" pro ")), "pro");
    }

    #[test]
    fn quota_follows_plan_overrides() {
        let registry = registry_with(SlotPolicyConfig {
            default_lifetime_quota: 2,
            plan_quotas: BTreeMap::from([("pro".to_string(), 10)]),
        });
        assert_eq!(registry.quota_for("pro"), 10);
        assert_eq!(registry.quota_for(DEFAULT_PLAN), 2);
    }
}
