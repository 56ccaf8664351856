//! Read-only consistency checks over the slot ledger.
//!
//! Counters are derived from rows, so the ledger cannot drift from a stored
//! count; these checks look for row-level damage instead (gaps in sequence
//! numbers, bindings detached from their slot, plaintext credentials).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SlotPolicyConfig;
use crate::crypto::is_encrypted_payload;
use crate::error::SlotError;
use crate::models::transfer_request::TransferRequestStatus;
use crate::models::{AccountBinding, AccountSlot, TransferRequest, transfer_request};
use crate::repositories::{SlotRepository, to_db_time};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditFinding {
    /// Sequence numbers for an owner and provider are not exactly 1..=n
    SequenceGap {
        owner_id: Uuid,
        provider: String,
        sequence_numbers: Vec<i32>,
    },
    /// Historical usage is above the quota of the plan recorded on the slots
    OverQuota {
        owner_id: Uuid,
        provider: String,
        historical: u64,
        limit: u32,
    },
    /// Binding points at a slot that does not exist
    OrphanBinding { binding_id: Uuid, slot_id: Uuid },
    /// Binding and slot disagree about the owner or the identity
    OwnerMismatch {
        binding_id: Uuid,
        slot_id: Uuid,
        binding_owner_id: Uuid,
        slot_owner_id: Uuid,
    },
    /// Binding and slot disagree about being active
    ActivityMismatch {
        binding_id: Uuid,
        slot_id: Uuid,
        binding_active: bool,
        slot_active: bool,
    },
    /// Stored credential is not in the encrypted envelope format
    PlaintextCredential { binding_id: Uuid, field: String },
    /// Pending transfer request whose deadline has passed
    OverduePendingTransfer {
        request_id: Uuid,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AuditReport {
    pub ledgers_checked: usize,
    pub bindings_checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Walks every ledger, binding and pending transfer without writing anything.
pub async fn audit_ledger<C: ConnectionTrait>(
    conn: &C,
    policy: &SlotPolicyConfig,
    now: DateTime<Utc>,
) -> Result<AuditReport, SlotError> {
    let mut report = AuditReport::default();

    for (owner_id, provider) in SlotRepository::ledger_keys(conn).await? {
        let slots = SlotRepository::list_ledger(conn, owner_id, &provider).await?;
        report.ledgers_checked += 1;

        let sequence_numbers: Vec<i32> = slots.iter().map(|slot| slot.sequence_number).collect();
        if !is_contiguous(&sequence_numbers) {
            report.findings.push(AuditFinding::SequenceGap {
                owner_id,
                provider: provider.clone(),
                sequence_numbers,
            });
        }

        // The most generous plan seen on the ledger sets the bar
        let limit = slots
            .iter()
            .map(|slot| policy.quota_for(&slot.plan_at_creation))
            .max()
            .unwrap_or(policy.default_lifetime_quota);
        let historical = slots.len() as u64;
        if historical > u64::from(limit) {
            report.findings.push(AuditFinding::OverQuota {
                owner_id,
                provider,
                historical,
                limit,
            });
        }
    }

    let slots: HashMap<Uuid, _> = AccountSlot::find()
        .all(conn)
        .await?
        .into_iter()
        .map(|slot| (slot.id, slot))
        .collect();

    for binding in AccountBinding::find().all(conn).await? {
        report.bindings_checked += 1;

        match slots.get(&binding.slot_id) {
            None => report.findings.push(AuditFinding::OrphanBinding {
                binding_id: binding.id,
                slot_id: binding.slot_id,
            }),
            Some(slot) => {
                if slot.owner_id != binding.owner_id
                    || slot.provider != binding.provider
                    || slot.external_account_id != binding.external_account_id
                {
                    report.findings.push(AuditFinding::OwnerMismatch {
                        binding_id: binding.id,
                        slot_id: slot.id,
                        binding_owner_id: binding.owner_id,
                        slot_owner_id: slot.owner_id,
                    });
                }
                if slot.is_active != binding.is_active {
                    report.findings.push(AuditFinding::ActivityMismatch {
                        binding_id: binding.id,
                        slot_id: slot.id,
                        binding_active: binding.is_active,
                        slot_active: slot.is_active,
                    });
                }
            }
        }

        if !is_encrypted_payload(&binding.access_token_ciphertext) {
            report.findings.push(AuditFinding::PlaintextCredential {
                binding_id: binding.id,
                field: "access_token".to_string(),
            });
        }
        if let Some(refresh) = binding.refresh_token_ciphertext.as_deref()
            && !is_encrypted_payload(refresh)
        {
            report.findings.push(AuditFinding::PlaintextCredential {
                binding_id: binding.id,
                field: "refresh_token".to_string(),
            });
        }
    }

    let overdue = TransferRequest::find()
        .filter(transfer_request::Column::Status.eq(TransferRequestStatus::Pending.as_str()))
        .filter(transfer_request::Column::ExpiresAt.lte(to_db_time(now)))
        .all(conn)
        .await?;
    report
        .findings
        .extend(overdue.into_iter().map(|request| AuditFinding::OverduePendingTransfer {
            request_id: request.id,
            expires_at: request.expires_at.with_timezone(&Utc),
        }));

    Ok(report)
}

fn is_contiguous(sequence_numbers: &[i32]) -> bool {
    let unique: HashSet<i32> = sequence_numbers.iter().copied().collect();
    unique.len() == sequence_numbers.len()
        && sequence_numbers
            .iter()
            .all(|n| *n >= 1 && (*n as usize) <= sequence_numbers.len())
}
