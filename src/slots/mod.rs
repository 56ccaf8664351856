//! # Slot & Ownership Reconciliation
//!
//! Decides who owns an external identity, whether a connection consumes a new
//! lifetime slot, and how ownership moves between owners.
//!
//! Every connect/reconnect goes through [`guard::ConcurrencyGuard`], which
//! resolves the slot with [`registry::SlotRegistry`] and writes credentials
//! with [`binding::AccountBinding`]. Cross-owner conflicts are handed to
//! [`transfer::OwnershipTransferCoordinator`], which records a
//! [`notifications::NotificationLedger`] entry for the owner who lost the
//! identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::{binding as binding_model, slot};

pub mod audit;
pub mod binding;
pub mod guard;
pub mod identity;
pub mod notifications;
pub mod reference;
pub mod registry;
pub mod sweeper;
pub mod transfer;

pub use binding::AccountBinding;
pub use guard::ConcurrencyGuard;
pub use identity::{IdentityVerifier, RecordedLabelVerifier};
pub use notifications::{NotificationLedger, TransferNotice};
pub use reference::{ReferenceClaims, TransferReferenceSigner};
pub use registry::SlotRegistry;
pub use sweeper::TransferRequestSweeper;
pub use transfer::{OwnershipDecision, OwnershipTransferCoordinator, TransferOutcome};

/// Fresh credentials produced by the OAuth exchange. Opaque to the engine
/// apart from being encrypted before storage.
#[derive(Clone, Deserialize, ToSchema)]
pub struct CredentialBundle {
    pub access_token: String,
    /// Providers frequently omit this on repeat authorization
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Display identity reported by the provider, usually the account email
    #[serde(default)]
    pub identity_label: Option<String>,
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("identity_label", &self.identity_label)
            .finish()
    }
}

/// Input to the connect/reconnect entry point.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub owner_id: Uuid,
    pub provider: String,
    pub external_account_id: String,
    /// Plan used to pick the lifetime quota; falls back to the default plan
    pub plan: Option<String>,
    pub credentials: CredentialBundle,
    /// Optimistic check: `Some(None)` expects the identity to be unowned,
    /// `Some(Some(id))` expects `id` to hold it
    pub expected_current_owner: Option<Option<Uuid>>,
}

/// Result of a successful connect attempt.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Connected {
        binding: BindingDescriptor,
        /// True when an existing slot was reused
        reconnected: bool,
    },
    Transferred {
        binding: BindingDescriptor,
        from_owner_id: Option<Uuid>,
        already_transferred: bool,
    },
    TransferPending {
        request_id: Uuid,
        reference: String,
        expires_at: DateTime<Utc>,
    },
}

/// Token-free view of a binding and its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct BindingDescriptor {
    pub binding_id: Uuid,
    pub slot_id: Uuid,
    pub owner_id: Uuid,
    pub provider: String,
    pub external_account_id: String,
    pub external_identity_label: Option<String>,
    pub sequence_number: i32,
    pub is_active: bool,
    pub has_refresh_token: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub ownership_version: i32,
}

impl BindingDescriptor {
    pub fn new(binding: &binding_model::Model, slot: &slot::Model) -> Self {
        Self {
            binding_id: binding.id,
            slot_id: slot.id,
            owner_id: binding.owner_id,
            provider: binding.provider.clone(),
            external_account_id: binding.external_account_id.clone(),
            external_identity_label: binding.external_identity_label.clone(),
            sequence_number: slot.sequence_number,
            is_active: binding.is_active,
            has_refresh_token: binding.refresh_token_ciphertext.is_some(),
            token_expires_at: binding.token_expires_at.map(|dt| dt.with_timezone(&Utc)),
            ownership_version: binding.ownership_version,
        }
    }
}

/// Derived slot usage for an owner and provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct SlotUsage {
    /// Slots ever allocated against the owner's quota; never decreases
    pub historical: u64,
    /// Active slots the owner currently holds, including transferred-in ones
    pub active: u64,
    pub limit: u32,
    pub remaining: u64,
}

impl SlotUsage {
    pub fn new(historical: u64, active: u64, limit: u32) -> Self {
        Self {
            historical,
            active,
            limit,
            remaining: u64::from(limit).saturating_sub(historical),
        }
    }
}

/// Trims an external account id, rejecting blank input.
pub fn normalize_external_account_id(raw: &str) -> Result<String, SlotError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SlotError::Validation(
            "external_account_id must not be blank".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Lowercases and trims a provider slug, rejecting blank input.
pub fn normalize_provider(raw: &str) -> Result<String, SlotError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SlotError::Validation("provider must not be blank".to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}
