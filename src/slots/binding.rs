//! AccountBinding: the live credential record for an external identity.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use tracing::{info, warn};
use uuid::Uuid;

use super::registry::{SlotClaim, SlotRegistry};
use super::{BindingDescriptor, CredentialBundle, normalize_external_account_id, normalize_provider};
use crate::crypto::{CryptoKey, encrypt_credentials};
use crate::error::SlotError;
use crate::models::{binding, slot};
use crate::repositories::{BindingCredentials, BindingRepository, SlotRepository};

/// Inputs for writing a binding on connect or reconnect.
#[derive(Debug, Clone, Copy)]
pub struct BindingWrite<'a> {
    pub owner_id: Uuid,
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub plan: &'a str,
    pub quota_limit: u32,
    pub credentials: &'a CredentialBundle,
}

/// A binding together with the slot it occupies.
#[derive(Debug, Clone)]
pub struct BoundSlot {
    pub binding: binding::Model,
    pub slot: slot::Model,
    pub reused_slot: bool,
}

impl BoundSlot {
    pub fn descriptor(&self) -> BindingDescriptor {
        BindingDescriptor::new(&self.binding, &self.slot)
    }
}

#[derive(Debug, Clone)]
pub struct AccountBinding {
    db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
    registry: SlotRegistry,
}

impl AccountBinding {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey, registry: SlotRegistry) -> Self {
        Self {
            db,
            crypto_key,
            registry,
        }
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    pub fn crypto_key(&self) -> &CryptoKey {
        &self.crypto_key
    }

    /// Resolves the slot, then upserts the binding, inside the caller's transaction.
    ///
    /// Fails with [`SlotError::OwnerChangedConcurrently`] when the locked
    /// binding belongs to another owner, and with [`SlotError::TokenMissing`]
    /// when neither the bundle nor the stored binding has a refresh token.
    pub async fn connect<C: ConnectionTrait>(
        &self,
        conn: &C,
        write: BindingWrite<'_>,
        now: DateTime<Utc>,
    ) -> Result<BoundSlot, SlotError> {
        let existing =
            BindingRepository::lock_by_identity(conn, write.provider, write.external_account_id)
                .await?;

        if let Some(ref current) = existing
            && current.owner_id != write.owner_id
        {
            return Err(SlotError::OwnerChangedConcurrently {
                actual_owner: Some(current.owner_id),
            });
        }

        let resolution = self
            .registry
            .resolve_or_create(
                conn,
                SlotClaim {
                    owner_id: write.owner_id,
                    provider: write.provider,
                    external_account_id: write.external_account_id,
                    external_identity_label: write.credentials.identity_label.as_deref(),
                    plan: write.plan,
                    quota_limit: write.quota_limit,
                },
                now,
            )
            .await?;

        // Quota is decided before credentials; a TokenMissing here rolls the slot back
        let sealed = seal_credentials(
            &self.crypto_key,
            write.provider,
            write.external_account_id,
            write.credentials,
        )?;
        let credentials = carry_refresh_token(sealed, existing.as_ref())?;

        let binding = match existing {
            Some(current) => {
                BindingRepository::refresh(conn, current, resolution.slot.id, credentials, now)
                    .await?
            }
            None => {
                BindingRepository::insert(
                    conn,
                    write.owner_id,
                    write.provider,
                    write.external_account_id,
                    resolution.slot.id,
                    credentials,
                    now,
                )
                .await?
            }
        };

        Ok(BoundSlot {
            binding,
            slot: resolution.slot,
            reused_slot: resolution.reused,
        })
    }

    /// Current holder of an external identity, active or not
    pub async fn get_owner(
        &self,
        provider: &str,
        external_account_id: &str,
    ) -> Result<Option<Uuid>, SlotError> {
        owner_of(&*self.db, provider, external_account_id).await
    }

    /// Marks the owner's binding inactive and deactivates its slot. Stored
    /// ciphertexts are retained for a later reconnect.
    pub async fn disconnect(
        &self,
        owner_id: Uuid,
        provider: &str,
        external_account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BindingDescriptor, SlotError> {
        let provider = normalize_provider(provider)?;
        let external_account_id = normalize_external_account_id(external_account_id)?;

        let txn = self.db.begin().await?;

        let Some(current) =
            BindingRepository::lock_by_identity(&txn, &provider, &external_account_id).await?
        else {
            txn.rollback().await?;
            return Err(SlotError::BindingNotFound);
        };

        if current.owner_id != owner_id {
            txn.rollback().await?;
            return Err(SlotError::BindingNotFound);
        }

        let slot_id = current.slot_id;
        let binding = BindingRepository::deactivate(&txn, current, now).await?;
        self.registry.deactivate(&txn, slot_id, now).await?;
        let slot = SlotRepository::find_by_id(&txn, slot_id)
            .await?
            .ok_or(SlotError::BindingNotFound)?;

        txn.commit().await?;

        info!(
            owner_id = %owner_id,
            provider = %provider,
            external_account_id = %external_account_id,
            slot_id = %slot_id,
            "Account disconnected"
        );

        Ok(BindingDescriptor::new(&binding, &slot))
    }

    /// Token-free descriptors for every binding the owner holds
    pub async fn list_for_owner(&self, owner_id: Uuid) -> Result<Vec<BindingDescriptor>, SlotError> {
        let bindings = BindingRepository::list_for_owner(&*self.db, owner_id).await?;
        let slots: HashMap<Uuid, slot::Model> = SlotRepository::list_for_owner(&*self.db, owner_id)
            .await?
            .into_iter()
            .map(|slot| (slot.id, slot))
            .collect();

        Ok(bindings
            .iter()
            .filter_map(|binding| match slots.get(&binding.slot_id) {
                Some(slot) => Some(BindingDescriptor::new(binding, slot)),
                None => {
                    warn!(
                        binding_id = %binding.id,
                        slot_id = %binding.slot_id,
                        "Binding references a slot held by another owner"
                    );
                    None
                }
            })
            .collect())
    }
}

/// Current holder of an external identity on any connection
pub async fn owner_of<C: ConnectionTrait>(
    conn: &C,
    provider: &str,
    external_account_id: &str,
) -> Result<Option<Uuid>, SlotError> {
    Ok(
        BindingRepository::find_by_identity(conn, provider, external_account_id)
            .await?
            .map(|binding| binding.owner_id),
    )
}

/// Encrypts a fresh credential bundle for an identity
pub fn seal_credentials(
    key: &CryptoKey,
    provider: &str,
    external_account_id: &str,
    bundle: &CredentialBundle,
) -> Result<BindingCredentials, SlotError> {
    let encrypted = encrypt_credentials(
        key,
        provider,
        external_account_id,
        &bundle.access_token,
        bundle.refresh_token.as_deref().filter(|token| !token.is_empty()),
    )?;

    Ok(BindingCredentials {
        encrypted,
        token_expires_at: bundle.expires_at,
        external_identity_label: bundle
            .identity_label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string),
    })
}

/// Falls back to the stored refresh token when the new credentials omit one.
/// Ciphertexts are bound to the identity, so the stored one stays valid.
pub fn carry_refresh_token(
    mut credentials: BindingCredentials,
    existing: Option<&binding::Model>,
) -> Result<BindingCredentials, SlotError> {
    if credentials.encrypted.refresh_token.is_none() {
        credentials.encrypted.refresh_token =
            existing.and_then(|binding| binding.refresh_token_ciphertext.clone());
    }

    if credentials.encrypted.refresh_token.is_none() {
        return Err(SlotError::TokenMissing);
    }

    Ok(credentials)
}
