//! ConcurrencyGuard: the single connect/reconnect entry point.
//!
//! One ownership read yields an [`OwnershipDecision`]; the matching write runs
//! in its own transaction. The global `(provider, external_account_id)`
//! constraint backstops paths that do not pre-lock, and a violation is treated
//! as a signal to re-read and re-decide rather than as a failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{DatabaseConnection, TransactionTrait};
use tracing::{debug, info, instrument, warn};

use super::binding::{AccountBinding, BindingWrite, BoundSlot, owner_of};
use super::identity::IdentityVerifier;
use super::transfer::{OwnershipDecision, OwnershipTransferCoordinator, TransferOutcome};
use super::{ConnectOutcome, ConnectRequest, normalize_external_account_id, normalize_provider};
use crate::error::SlotError;
use crate::models::binding;
use crate::repositories::{BindingRepository, SlotRepository};

/// Attempts before a persistent race is reported to the caller
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct ConcurrencyGuard {
    db: Arc<DatabaseConnection>,
    binding: AccountBinding,
    coordinator: OwnershipTransferCoordinator,
    verifier: Arc<dyn IdentityVerifier>,
}

impl std::fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("binding", &self.binding)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyGuard {
    pub fn new(
        db: Arc<DatabaseConnection>,
        binding: AccountBinding,
        coordinator: OwnershipTransferCoordinator,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            db,
            binding,
            coordinator,
            verifier,
        }
    }

    pub fn binding(&self) -> &AccountBinding {
        &self.binding
    }

    pub fn coordinator(&self) -> &OwnershipTransferCoordinator {
        &self.coordinator
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<ConnectOutcome, SlotError> {
        self.connect_at(request, Utc::now()).await
    }

    /// Connects or reconnects an identity as of `now`.
    #[instrument(skip_all, fields(owner_id = %request.owner_id))]
    pub async fn connect_at(
        &self,
        request: ConnectRequest,
        now: DateTime<Utc>,
    ) -> Result<ConnectOutcome, SlotError> {
        let result = self.connect_inner(&request, now).await;
        counter!("slot_connect_total", "outcome" => outcome_label(&result)).increment(1);
        result
    }

    async fn connect_inner(
        &self,
        request: &ConnectRequest,
        now: DateTime<Utc>,
    ) -> Result<ConnectOutcome, SlotError> {
        let provider = normalize_provider(&request.provider)?;
        let external_account_id = normalize_external_account_id(&request.external_account_id)?;
        if request.credentials.access_token.trim().is_empty() {
            return Err(SlotError::Validation(
                "access_token must not be empty".to_string(),
            ));
        }

        let registry = self.binding.registry();
        let plan = registry.plan_or_default(request.plan.as_deref());
        let quota_limit = registry.quota_for(plan);

        let mut last_observed = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let current =
                BindingRepository::find_by_identity(&*self.db, &provider, &external_account_id)
                    .await?;
            let observed = current.as_ref().map(|binding| binding.owner_id);

            // A retry that finds our own concurrent write is idempotent success
            let expected = if attempt > 1 && observed == Some(request.owner_id) {
                None
            } else {
                request.expected_current_owner
            };

            let identity_matches = match current.as_ref() {
                Some(binding) if binding.owner_id != request.owner_id => {
                    let recorded = self.recorded_label(binding).await?;
                    self.verifier
                        .matches(
                            &provider,
                            &external_account_id,
                            request.credentials.identity_label.as_deref(),
                            recorded.as_deref(),
                        )
                        .await
                }
                _ => false,
            };

            let decision =
                OwnershipDecision::decide(request.owner_id, observed, expected, identity_matches);

            debug!(
                provider = %provider,
                external_account_id = %external_account_id,
                observed_owner = ?observed,
                decision = decision.as_str(),
                attempt,
                "Ownership decision"
            );

            let attempt_result = match decision {
                OwnershipDecision::Claim | OwnershipDecision::Reconnect => self
                    .write_binding(
                        BindingWrite {
                            owner_id: request.owner_id,
                            provider: &provider,
                            external_account_id: &external_account_id,
                            plan,
                            quota_limit,
                            credentials: &request.credentials,
                        },
                        now,
                    )
                    .await
                    .map(|bound| ConnectOutcome::Connected {
                        binding: bound.descriptor(),
                        reconnected: bound.reused_slot,
                    }),
                OwnershipDecision::AutoTransfer { from_owner_id } => self
                    .coordinator
                    .auto_transfer(
                        request.owner_id,
                        from_owner_id,
                        &provider,
                        &external_account_id,
                        &request.credentials,
                        now,
                    )
                    .await
                    .and_then(|outcome| match outcome {
                        TransferOutcome::Success {
                            binding,
                            from_owner_id,
                            already_transferred,
                        } => Ok(ConnectOutcome::Transferred {
                            binding,
                            from_owner_id,
                            already_transferred,
                        }),
                        TransferOutcome::OwnerChanged { actual_owner } => {
                            Err(SlotError::OwnerChangedConcurrently { actual_owner })
                        }
                    }),
                OwnershipDecision::StagePending { from_owner_id } => self
                    .coordinator
                    .stage(
                        request.owner_id,
                        from_owner_id,
                        &provider,
                        &external_account_id,
                        &request.credentials,
                        now,
                    )
                    .await
                    .map(|staged| ConnectOutcome::TransferPending {
                        request_id: staged.request_id,
                        reference: staged.reference,
                        expires_at: staged.expires_at,
                    }),
                OwnershipDecision::Reject { actual_owner } => {
                    info!(
                        provider = %provider,
                        external_account_id = %external_account_id,
                        actual_owner = ?actual_owner,
                        "Expected owner did not match"
                    );
                    return Err(SlotError::OwnerChangedConcurrently { actual_owner });
                }
            };

            match attempt_result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_race(&err) => {
                    warn!(
                        provider = %provider,
                        external_account_id = %external_account_id,
                        attempt,
                        error = %err,
                        "Lost ownership race; re-reading owner"
                    );
                    if let SlotError::OwnerChangedConcurrently { actual_owner } = err {
                        last_observed = actual_owner;
                    } else {
                        last_observed =
                            owner_of(&*self.db, &provider, &external_account_id).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            provider = %provider,
            external_account_id = %external_account_id,
            actual_owner = ?last_observed,
            "Giving up after repeated ownership races"
        );
        Err(SlotError::OwnerChangedConcurrently {
            actual_owner: last_observed,
        })
    }

    async fn write_binding(
        &self,
        write: BindingWrite<'_>,
        now: DateTime<Utc>,
    ) -> Result<BoundSlot, SlotError> {
        let txn = self.db.begin().await?;
        match self.binding.connect(&txn, write, now).await {
            Ok(bound) => {
                txn.commit().await?;
                info!(
                    owner_id = %write.owner_id,
                    provider = write.provider,
                    external_account_id = write.external_account_id,
                    slot_id = %bound.slot.id,
                    sequence_number = bound.slot.sequence_number,
                    reconnected = bound.reused_slot,
                    "Account connected"
                );
                Ok(bound)
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    }

    /// Label the identity was recorded with, preferring the slot's copy
    async fn recorded_label(&self, binding: &binding::Model) -> Result<Option<String>, SlotError> {
        let slot_label = SlotRepository::find_by_id(&*self.db, binding.slot_id)
            .await?
            .and_then(|slot| slot.external_identity_label);
        Ok(slot_label.or_else(|| binding.external_identity_label.clone()))
    }
}

fn is_race(err: &SlotError) -> bool {
    err.is_unique_violation() || matches!(err, SlotError::OwnerChangedConcurrently { .. })
}

fn outcome_label(result: &Result<ConnectOutcome, SlotError>) -> &'static str {
    match result {
        Ok(ConnectOutcome::Connected {
            reconnected: false, ..
        }) => "connected",
        Ok(ConnectOutcome::Connected {
            reconnected: true, ..
        }) => "reconnected",
        Ok(ConnectOutcome::Transferred { .. }) => "transferred",
        Ok(ConnectOutcome::TransferPending { .. }) => "transfer_pending",
        Err(SlotError::Validation(_)) => "validation_failed",
        Err(SlotError::QuotaExceeded { .. }) => "quota_exceeded",
        Err(SlotError::TokenMissing) => "token_missing",
        Err(SlotError::OwnerChangedConcurrently { .. }) => "owner_changed",
        Err(_) => "error",
    }
}
