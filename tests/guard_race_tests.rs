//! ConcurrencyGuard recovery when ownership moves between its read and its write.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use account_slots::crypto::CryptoKey;
use account_slots::error::SlotError;
use account_slots::repositories::{NewSlot, SlotRepository};
use account_slots::server::AppState;
use account_slots::slots::binding::seal_credentials;
use account_slots::slots::transfer::{TransferCommand, TransferPath};
use account_slots::slots::{
    ConcurrencyGuard, ConnectOutcome, IdentityVerifier, OwnershipTransferCoordinator,
    TransferOutcome,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

const LABEL: &str = "shared@example.com";

/// Matches on the first call, but only after handing the identity to
/// `interloper`, as a concurrent request would.
struct HandOffOnFirstCheck {
    coordinator: OwnershipTransferCoordinator,
    key: CryptoKey,
    previous_owner: Uuid,
    interloper: Uuid,
    later_checks_match: bool,
    calls: AtomicU32,
}

#[async_trait]
impl IdentityVerifier for HandOffOnFirstCheck {
    async fn matches(
        &self,
        provider: &str,
        external_account_id: &str,
        _claimed_label: Option<&str>,
        _recorded_label: Option<&str>,
    ) -> bool {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return self.later_checks_match;
        }

        let credentials = seal_credentials(
            &self.key,
            provider,
            external_account_id,
            &bundle("a-interloper", Some("r-interloper"), Some(LABEL)),
        )
        .expect("credentials seal");
        let outcome = self
            .coordinator
            .transfer(
                TransferCommand {
                    provider,
                    external_account_id,
                    new_owner_id: self.interloper,
                    expected_old_owner_id: self.previous_owner,
                    credentials,
                    request_id: None,
                    path: TransferPath::Automatic,
                },
                t0(),
            )
            .await
            .expect("interloper transfer");
        assert!(matches!(outcome, TransferOutcome::Success { .. }));
        true
    }
}

async fn guard_with_hand_off(
    state: &AppState,
    previous_owner: Uuid,
    interloper: Uuid,
    later_checks_match: bool,
) -> Result<(ConcurrencyGuard, Arc<HandOffOnFirstCheck>)> {
    let verifier = Arc::new(HandOffOnFirstCheck {
        coordinator: state.guard.coordinator().clone(),
        key: CryptoKey::new(CRYPTO_KEY.to_vec())?,
        previous_owner,
        interloper,
        later_checks_match,
        calls: AtomicU32::new(0),
    });
    let guard = ConcurrencyGuard::new(
        state.db.clone(),
        state.guard.binding().clone(),
        state.guard.coordinator().clone(),
        verifier.clone(),
    );
    Ok((guard, verifier))
}

#[tokio::test]
async fn lost_auto_transfer_is_redecided_against_the_new_owner() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    state
        .guard
        .connect_at(connect_request(o, "x1", bundle("a", Some("r"), Some(LABEL))), t0())
        .await?;

    let (guard, verifier) = guard_with_hand_off(&state, o, c, false).await?;
    let outcome = guard
        .connect_at(connect_request(b, "x1", bundle("a-b", Some("r-b"), Some(LABEL))), t0())
        .await?;

    let ConnectOutcome::TransferPending { request_id, .. } = outcome else {
        panic!("expected TransferPending, got {outcome:?}");
    };
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);

    // Staged against the owner observed on the retry, not the first read
    let request = transfer_request(&state.db, request_id).await?.unwrap();
    assert_eq!(request.current_owner_id, c);
    let binding = binding_for(&state.db, "x1").await?.unwrap();
    assert_eq!(binding.owner_id, c);
    assert_eq!(binding.ownership_version, 1);
    assert_eq!(count_events(&state.db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn lost_auto_transfer_retries_into_a_transfer_from_the_new_owner() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    state
        .guard
        .connect_at(connect_request(o, "x1", bundle("a", Some("r"), Some(LABEL))), t0())
        .await?;

    let (guard, _) = guard_with_hand_off(&state, o, c, true).await?;
    let outcome = guard
        .connect_at(connect_request(b, "x1", bundle("a-b", None, Some(LABEL))), t0())
        .await?;

    assert!(matches!(
        outcome,
        ConnectOutcome::Transferred {
            from_owner_id: Some(from),
            already_transferred: false,
            ..
        } if from == c
    ));
    let binding = binding_for(&state.db, "x1").await?.unwrap();
    assert_eq!(binding.owner_id, b);
    assert_eq!(binding.ownership_version, 2);
    assert_eq!(state.notifications.list_unacknowledged(o).await?.len(), 1);
    assert_eq!(state.notifications.list_unacknowledged(c).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn expectation_is_rechecked_after_a_lost_race() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    state
        .guard
        .connect_at(connect_request(o, "x1", bundle("a", Some("r"), Some(LABEL))), t0())
        .await?;

    let (guard, _) = guard_with_hand_off(&state, o, c, true).await?;
    let mut request = connect_request(b, "x1", bundle("a-b", Some("r-b"), Some(LABEL)));
    request.expected_current_owner = Some(Some(o));
    let err = guard.connect_at(request, t0()).await.unwrap_err();

    assert!(matches!(
        err,
        SlotError::OwnerChangedConcurrently { actual_owner: Some(owner) } if owner == c
    ));
    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, c);
    Ok(())
}

#[tokio::test]
async fn unique_violations_surface_as_owner_changed_after_retries() -> Result<()> {
    let state = setup_state(3).await?;
    let (b, c) = (Uuid::new_v4(), Uuid::new_v4());

    // A slot for the identity without a binding makes every claim collide on
    // the identity index
    SlotRepository::insert(
        &*state.db,
        NewSlot {
            owner_id: c,
            provider: PROVIDER,
            external_account_id: "x1",
            external_identity_label: None,
            sequence_number: 1,
            plan: "free",
        },
        t0(),
    )
    .await?;

    let err = state
        .guard
        .connect_at(connect_request(b, "x1", bundle("a", Some("r"), None)), t0())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SlotError::OwnerChangedConcurrently { actual_owner: None }
    ));
    assert_eq!(count_slots(&state.db).await?, 1);
    assert_eq!(count_bindings(&state.db).await?, 0);
    assert_eq!(usage(&state, b).await?.historical, 0);
    Ok(())
}
