//! OwnershipTransferCoordinator: moves an external identity between owners.
//!
//! A claim on an identity held by someone else is either transferred at once
//! (verified display identity) or staged as a time-boxed request that the
//! claimant confirms with a signed reference. Both paths end in
//! [`OwnershipTransferCoordinator::transfer`], a single locked
//! read-compare-write transaction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use metrics::counter;
use sea_orm::{DatabaseConnection, TransactionTrait};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::binding::{AccountBinding, carry_refresh_token, owner_of, seal_credentials};
use super::notifications::NotificationLedger;
use super::reference::TransferReferenceSigner;
use super::{BindingDescriptor, CredentialBundle};
use crate::crypto::{CryptoError, EncryptedCredentials};
use crate::error::SlotError;
use crate::models::transfer_request::{self, TransferRequestStatus};
use crate::repositories::{
    BindingCredentials, BindingRepository, NewTransferEvent, SlotRepository, StagedTransfer,
    TransferRequestRepository,
};

/// Outcome of one ownership read, computed before any write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipDecision {
    /// Nobody holds the identity yet
    Claim,
    /// The acting owner already holds it
    Reconnect,
    /// Another owner holds it and the claimant's display identity matches
    AutoTransfer { from_owner_id: Uuid },
    /// Another owner holds it and the claimant must confirm explicitly
    StagePending { from_owner_id: Uuid },
    /// The caller's expected owner does not match what was read
    Reject { actual_owner: Option<Uuid> },
}

impl OwnershipDecision {
    pub fn decide(
        acting_owner_id: Uuid,
        observed_owner: Option<Uuid>,
        expected_owner: Option<Option<Uuid>>,
        identity_matches: bool,
    ) -> Self {
        if let Some(expected) = expected_owner
            && expected != observed_owner
        {
            return Self::Reject {
                actual_owner: observed_owner,
            };
        }

        match observed_owner {
            None => Self::Claim,
            Some(owner) if owner == acting_owner_id => Self::Reconnect,
            Some(owner) if identity_matches => Self::AutoTransfer {
                from_owner_id: owner,
            },
            Some(owner) => Self::StagePending {
                from_owner_id: owner,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Reconnect => "reconnect",
            Self::AutoTransfer { .. } => "auto_transfer",
            Self::StagePending { .. } => "stage_pending",
            Self::Reject { .. } => "reject",
        }
    }
}

/// How a transfer was authorized, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    Automatic,
    Confirmed,
}

impl TransferPath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Confirmed => "confirmed",
        }
    }
}

/// Input to the atomic transfer primitive.
#[derive(Debug, Clone)]
pub struct TransferCommand<'a> {
    pub provider: &'a str,
    pub external_account_id: &'a str,
    pub new_owner_id: Uuid,
    pub expected_old_owner_id: Uuid,
    pub credentials: BindingCredentials,
    /// Staged request consumed by this transfer
    pub request_id: Option<Uuid>,
    pub path: TransferPath,
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Success {
        binding: BindingDescriptor,
        from_owner_id: Option<Uuid>,
        /// A concurrent duplicate already completed; nothing was written
        already_transferred: bool,
    },
    /// The identity is no longer held by the expected owner; nothing was written
    OwnerChanged { actual_owner: Option<Uuid> },
}

/// A freshly staged or refreshed transfer request.
#[derive(Debug, Clone)]
pub struct StagedRequest {
    pub request_id: Uuid,
    pub reference: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OwnershipTransferCoordinator {
    db: Arc<DatabaseConnection>,
    binding: AccountBinding,
    ledger: NotificationLedger,
    signer: TransferReferenceSigner,
    ttl: Duration,
}

impl OwnershipTransferCoordinator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        binding: AccountBinding,
        ledger: NotificationLedger,
        signer: TransferReferenceSigner,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            db,
            binding,
            ledger,
            signer,
            ttl: Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX / 1000)),
        }
    }

    /// Reassigns the identity's slot and binding from `expected_old_owner_id`
    /// to `new_owner_id` under a row lock, recording one transfer event.
    pub async fn transfer(
        &self,
        command: TransferCommand<'_>,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome, SlotError> {
        let txn = self.db.begin().await?;

        let Some(current) = BindingRepository::lock_by_identity(
            &txn,
            command.provider,
            command.external_account_id,
        )
        .await?
        else {
            txn.rollback().await?;
            return Ok(TransferOutcome::OwnerChanged { actual_owner: None });
        };

        if current.owner_id == command.new_owner_id {
            if let Some(request_id) = command.request_id {
                TransferRequestRepository::mark_used(&txn, request_id, now).await?;
            }
            let slot = SlotRepository::find_by_id(&txn, current.slot_id)
                .await?
                .ok_or_else(|| missing_slot(current.slot_id))?;
            txn.commit().await?;

            debug!(
                provider = command.provider,
                external_account_id = command.external_account_id,
                new_owner_id = %command.new_owner_id,
                "Transfer already applied"
            );
            counter!(
                "slot_transfer_total",
                "path" => command.path.as_str(),
                "result" => "already_transferred"
            )
            .increment(1);

            return Ok(TransferOutcome::Success {
                binding: BindingDescriptor::new(&current, &slot),
                from_owner_id: None,
                already_transferred: true,
            });
        }

        if current.owner_id != command.expected_old_owner_id {
            txn.rollback().await?;
            counter!(
                "slot_transfer_total",
                "path" => command.path.as_str(),
                "result" => "owner_changed"
            )
            .increment(1);
            return Ok(TransferOutcome::OwnerChanged {
                actual_owner: Some(current.owner_id),
            });
        }

        let Some(slot) = SlotRepository::lock_by_id(&txn, current.slot_id).await? else {
            txn.rollback().await?;
            return Err(missing_slot(current.slot_id));
        };

        let from_owner_id = current.owner_id;
        let credentials = carry_refresh_token(command.credentials, Some(&current))?;

        SlotRepository::reassign(
            &txn,
            slot.id,
            command.new_owner_id,
            credentials.external_identity_label.as_deref(),
        )
        .await?;
        let binding =
            BindingRepository::reassign(&txn, current, command.new_owner_id, credentials, now)
                .await?;

        self.ledger
            .record(
                &txn,
                NewTransferEvent {
                    provider: command.provider,
                    external_account_id: command.external_account_id,
                    external_identity_label: binding.external_identity_label.as_deref(),
                    from_owner_id,
                    to_owner_id: command.new_owner_id,
                    ownership_version: binding.ownership_version,
                },
                now,
            )
            .await?;

        if let Some(request_id) = command.request_id {
            TransferRequestRepository::mark_used(&txn, request_id, now).await?;
        }

        let slot = SlotRepository::find_by_id(&txn, slot.id)
            .await?
            .ok_or_else(|| missing_slot(binding.slot_id))?;

        txn.commit().await?;

        info!(
            provider = command.provider,
            external_account_id = command.external_account_id,
            from_owner_id = %from_owner_id,
            to_owner_id = %command.new_owner_id,
            ownership_version = binding.ownership_version,
            path = command.path.as_str(),
            "Account ownership transferred"
        );
        counter!(
            "slot_transfer_total",
            "path" => command.path.as_str(),
            "result" => "transferred"
        )
        .increment(1);

        Ok(TransferOutcome::Success {
            binding: BindingDescriptor::new(&binding, &slot),
            from_owner_id: Some(from_owner_id),
            already_transferred: false,
        })
    }

    /// Transfers immediately with the claimant's fresh credentials
    pub async fn auto_transfer(
        &self,
        new_owner_id: Uuid,
        from_owner_id: Uuid,
        provider: &str,
        external_account_id: &str,
        credentials: &CredentialBundle,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome, SlotError> {
        let sealed = seal_credentials(
            self.binding.crypto_key(),
            provider,
            external_account_id,
            credentials,
        )?;

        self.transfer(
            TransferCommand {
                provider,
                external_account_id,
                new_owner_id,
                expected_old_owner_id: from_owner_id,
                credentials: sealed,
                request_id: None,
                path: TransferPath::Automatic,
            },
            now,
        )
        .await
    }

    /// Stages the claimant's credentials without touching the slot or binding.
    ///
    /// A live pending request from the same claimant is refreshed in place
    /// (same id, new credentials and expiry); overdue ones are expired first.
    pub async fn stage(
        &self,
        requesting_owner_id: Uuid,
        current_owner_id: Uuid,
        provider: &str,
        external_account_id: &str,
        credentials: &CredentialBundle,
        now: DateTime<Utc>,
    ) -> Result<StagedRequest, SlotError> {
        let sealed = seal_credentials(
            self.binding.crypto_key(),
            provider,
            external_account_id,
            credentials,
        )?;

        // References carry whole seconds
        let expires_at = (now + self.ttl).with_nanosecond(0).unwrap_or(now + self.ttl);

        let txn = self.db.begin().await?;

        let expired = TransferRequestRepository::expire_overdue(
            &txn,
            now,
            Some((provider, external_account_id, requesting_owner_id)),
        )
        .await?;
        if expired > 0 {
            counter!("slot_transfer_requests_expired_total").increment(expired);
        }

        let staged = StagedTransfer {
            provider,
            external_account_id,
            requesting_owner_id,
            current_owner_id,
            credentials: sealed,
            expires_at,
        };

        let pending = TransferRequestRepository::find_pending(
            &txn,
            provider,
            external_account_id,
            requesting_owner_id,
        )
        .await?;
        let refreshed = pending.is_some();
        let request = match pending {
            Some(existing) => TransferRequestRepository::refresh_pending(&txn, existing, staged).await?,
            None => TransferRequestRepository::insert(&txn, staged, now).await?,
        };

        txn.commit().await?;

        let reference = self.signer.sign(request.id, expires_at).map_err(|err| {
            SlotError::Crypto(CryptoError::EncryptionFailed(format!(
                "transfer reference: {err}"
            )))
        })?;

        info!(
            provider,
            external_account_id,
            requesting_owner_id = %requesting_owner_id,
            current_owner_id = %current_owner_id,
            request_id = %request.id,
            refreshed,
            expires_at = %expires_at,
            "Transfer request staged"
        );

        Ok(StagedRequest {
            request_id: request.id,
            reference,
            expires_at,
        })
    }

    /// Completes a staged transfer for the claimant that staged it.
    pub async fn confirm(
        &self,
        reference: &str,
        confirming_owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome, SlotError> {
        let claims = self.signer.verify(reference).map_err(|err| {
            debug!(error = %err, "Rejected transfer reference");
            SlotError::TransferNotFound
        })?;

        let Some(request) =
            TransferRequestRepository::find_by_id(&*self.db, claims.request_id).await?
        else {
            return Err(SlotError::TransferNotFound);
        };

        if request.requesting_owner_id != confirming_owner_id {
            return Err(SlotError::TransferNotFound);
        }

        let row_expired = now >= request.expires_at.with_timezone(&Utc);
        if row_expired || claims.is_expired(now) {
            if row_expired && TransferRequestRepository::mark_expired(&*self.db, request.id).await? {
                counter!("slot_transfer_requests_expired_total").increment(1);
            }
            info!(request_id = %request.id, "Transfer confirmation after expiry");
            return Err(SlotError::TransferExpired);
        }

        match request.status() {
            Some(TransferRequestStatus::Pending) => {
                self.confirm_pending(request, confirming_owner_id, now)
                    .await
            }
            Some(TransferRequestStatus::Used) => {
                self.replay_used(&request, confirming_owner_id).await
            }
            Some(TransferRequestStatus::Expired) => Err(SlotError::TransferExpired),
            None => {
                warn!(request_id = %request.id, status = %request.status, "Unknown transfer request status");
                Err(SlotError::TransferNotFound)
            }
        }
    }

    async fn confirm_pending(
        &self,
        request: transfer_request::Model,
        confirming_owner_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TransferOutcome, SlotError> {
        let credentials = BindingCredentials {
            encrypted: EncryptedCredentials {
                access_token: request.access_token_ciphertext.clone(),
                refresh_token: request.refresh_token_ciphertext.clone(),
            },
            token_expires_at: request.token_expires_at.map(|dt| dt.with_timezone(&Utc)),
            external_identity_label: request.claimed_identity_label.clone(),
        };

        let outcome = self
            .transfer(
                TransferCommand {
                    provider: &request.provider,
                    external_account_id: &request.external_account_id,
                    new_owner_id: confirming_owner_id,
                    expected_old_owner_id: request.current_owner_id,
                    credentials,
                    request_id: Some(request.id),
                    path: TransferPath::Confirmed,
                },
                now,
            )
            .await?;

        match outcome {
            TransferOutcome::OwnerChanged { actual_owner } => {
                // The request was staged against an owner who no longer holds the identity
                TransferRequestRepository::mark_expired(&*self.db, request.id).await?;
                warn!(
                    request_id = %request.id,
                    expected_owner_id = %request.current_owner_id,
                    actual_owner_id = ?actual_owner,
                    "Staged transfer is stale"
                );
                Err(SlotError::OwnerChangedConcurrently { actual_owner })
            }
            success => Ok(success),
        }
    }

    async fn replay_used(
        &self,
        request: &transfer_request::Model,
        confirming_owner_id: Uuid,
    ) -> Result<TransferOutcome, SlotError> {
        let owner = owner_of(&*self.db, &request.provider, &request.external_account_id).await?;
        if owner != Some(confirming_owner_id) {
            return Err(SlotError::OwnerChangedConcurrently {
                actual_owner: owner,
            });
        }

        let binding = BindingRepository::find_by_identity(
            &*self.db,
            &request.provider,
            &request.external_account_id,
        )
        .await?
        .ok_or(SlotError::TransferNotFound)?;
        let slot = SlotRepository::find_by_id(&*self.db, binding.slot_id)
            .await?
            .ok_or_else(|| missing_slot(binding.slot_id))?;

        Ok(TransferOutcome::Success {
            binding: BindingDescriptor::new(&binding, &slot),
            from_owner_id: Some(request.current_owner_id),
            already_transferred: true,
        })
    }
}

fn missing_slot(slot_id: Uuid) -> SlotError {
    SlotError::Database(sea_orm::DbErr::RecordNotFound(format!(
        "account slot {slot_id}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unowned_identity_is_claimed() {
        let me = Uuid::new_v4();
        assert_eq!(
            OwnershipDecision::decide(me, None, None, false),
            OwnershipDecision::Claim
        );
    }

    #[test]
    fn own_identity_is_reconnected_even_when_labels_match() {
        let me = Uuid::new_v4();
        assert_eq!(
            OwnershipDecision::decide(me, Some(me), None, true),
            OwnershipDecision::Reconnect
        );
    }

    #[test]
    fn foreign_identity_routes_on_identity_check() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert_eq!(
            OwnershipDecision::decide(me, Some(other), None, true),
            OwnershipDecision::AutoTransfer {
                from_owner_id: other
            }
        );
        assert_eq!(
            OwnershipDecision::decide(me, Some(other), None, false),
            OwnershipDecision::StagePending {
                from_owner_id: other
            }
        );
    }

    #[test]
    fn stale_expectation_is_rejected_with_actual_owner() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert_eq!(
            OwnershipDecision::decide(me, Some(other), Some(None), true),
            OwnershipDecision::Reject {
                actual_owner: Some(other)
            }
        );
        assert_eq!(
            OwnershipDecision::decide(me, None, Some(Some(other)), false),
            OwnershipDecision::Reject { actual_owner: None }
        );
    }

    #[test]
    fn matching_expectation_proceeds() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert_eq!(
            OwnershipDecision::decide(me, Some(other), Some(Some(other)), false),
            OwnershipDecision::StagePending {
                from_owner_id: other
            }
        );
        assert_eq!(
            OwnershipDecision::decide(me, None, Some(None), false),
            OwnershipDecision::Claim
        );
    }
}
