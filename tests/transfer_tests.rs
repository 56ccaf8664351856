//! Ownership transfer: automatic, staged and confirmed, and racing transfers.

use account_slots::crypto::CryptoKey;
use account_slots::error::SlotError;
use account_slots::models::transfer_request::TransferRequestStatus;
use account_slots::slots::binding::seal_credentials;
use account_slots::slots::transfer::{TransferCommand, TransferPath};
use account_slots::slots::{ConnectOutcome, TransferOutcome};
use anyhow::Result;
use chrono::Duration;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

const OWNER_LABEL: &str = "owner@example.com";

async fn owned_by(
    state: &account_slots::server::AppState,
    owner: Uuid,
    ext: &str,
) -> Result<()> {
    state
        .guard
        .connect_at(
            connect_request(owner, ext, bundle("a-owner", Some("r-owner"), Some(OWNER_LABEL))),
            t0(),
        )
        .await?;
    Ok(())
}

fn pending(outcome: ConnectOutcome) -> (Uuid, String) {
    match outcome {
        ConnectOutcome::TransferPending {
            request_id,
            reference,
            ..
        } => (request_id, reference),
        other => panic!("expected TransferPending, got {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_identity_stages_then_confirms() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;
    let slot_before = slot_for(&state.db, "x1").await?.unwrap();

    let (request_id, reference) = pending(
        state
            .guard
            .connect_at(
                connect_request(b, "x1", bundle("a-b", Some("r-b"), Some("b@example.com"))),
                t0(),
            )
            .await?,
    );

    // Staging touches neither the slot nor the binding
    let binding = binding_for(&state.db, "x1").await?.unwrap();
    assert_eq!(binding.owner_id, o);
    assert_eq!(binding.ownership_version, 0);
    assert_eq!(slot_for(&state.db, "x1").await?.unwrap(), slot_before);
    assert_eq!(count_events(&state.db).await?, 0);

    let o_before = usage(&state, o).await?;
    let b_before = usage(&state, b).await?;

    let outcome = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(30))
        .await?;
    let TransferOutcome::Success {
        binding: descriptor,
        from_owner_id,
        already_transferred,
    } = outcome
    else {
        panic!("expected Success");
    };
    assert!(!already_transferred);
    assert_eq!(from_owner_id, Some(o));
    assert_eq!(descriptor.owner_id, b);
    assert_eq!(descriptor.slot_id, slot_before.id);
    assert_eq!(descriptor.ownership_version, 1);

    let o_after = usage(&state, o).await?;
    let b_after = usage(&state, b).await?;
    assert_eq!(o_after.active, o_before.active - 1);
    assert_eq!(b_after.active, b_before.active + 1);
    assert_eq!(o_after.historical, o_before.historical);
    assert_eq!(b_after.historical, b_before.historical);

    let notices = state.notifications.list_unacknowledged(o).await?;
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].external_account_id, "x1");
    assert!(state.notifications.list_unacknowledged(b).await?.is_empty());

    let request = transfer_request(&state.db, request_id).await?.unwrap();
    assert_eq!(request.status(), Some(TransferRequestStatus::Used));
    assert!(request.used_at.is_some());

    // Confirming again after the TTL changes nothing
    let err = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(601))
        .await
        .unwrap_err();
    assert!(matches!(err, SlotError::TransferExpired));
    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().ownership_version, 1);
    assert_eq!(count_events(&state.db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn reconfirming_inside_the_window_reports_already_transferred() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let (_, reference) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a-b", Some("r-b"), None)), t0())
            .await?,
    );
    state.guard.coordinator().confirm(&reference, b, t0()).await?;
    let again = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(5))
        .await?;

    assert!(matches!(
        again,
        TransferOutcome::Success {
            already_transferred: true,
            ..
        }
    ));
    assert_eq!(count_events(&state.db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn confirming_after_expiry_leaves_ownership_alone() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let (request_id, reference) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a-b", Some("r-b"), None)), t0())
            .await?,
    );

    let err = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(600))
        .await
        .unwrap_err();
    assert!(matches!(err, SlotError::TransferExpired));

    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, o);
    let request = transfer_request(&state.db, request_id).await?.unwrap();
    assert_eq!(request.status(), Some(TransferRequestStatus::Expired));
    assert_eq!(count_events(&state.db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn only_the_claimant_can_confirm() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let (_, reference) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a-b", Some("r-b"), None)), t0())
            .await?,
    );

    for intruder in [o, Uuid::new_v4()] {
        let err = state
            .guard
            .coordinator()
            .confirm(&reference, intruder, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, SlotError::TransferNotFound));
    }

    let mut tampered = reference.clone();
    tampered.pop();
    tampered.push(if reference.ends_with('0') { '1' } else { '0' });
    let err = state
        .guard
        .coordinator()
        .confirm(&tampered, b, t0())
        .await
        .unwrap_err();
    assert!(matches!(err, SlotError::TransferNotFound));

    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, o);
    Ok(())
}

#[tokio::test]
async fn restaging_refreshes_the_same_request() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let (first, _) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a1", Some("r1"), None)), t0())
            .await?,
    );
    let later = t0() + Duration::seconds(120);
    let (second, reference) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a2", Some("r2"), None)), later)
            .await?,
    );

    assert_eq!(first, second);
    let request = transfer_request(&state.db, second).await?.unwrap();
    assert_eq!(request.expires_at.timestamp(), (later + Duration::seconds(600)).timestamp());

    // The refreshed expiry is what the new reference carries
    let outcome = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(650))
        .await?;
    assert!(matches!(outcome, TransferOutcome::Success { .. }));
    Ok(())
}

#[tokio::test]
async fn matching_identity_transfers_immediately() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let outcome = state
        .guard
        .connect_at(
            connect_request(b, "x1", bundle("a-b", None, Some(" owner@example.com "))),
            t0(),
        )
        .await?;

    let ConnectOutcome::Transferred {
        binding,
        from_owner_id,
        already_transferred,
    } = outcome
    else {
        panic!("expected Transferred, got {outcome:?}");
    };
    assert_eq!(from_owner_id, Some(o));
    assert!(!already_transferred);
    assert_eq!(binding.owner_id, b);
    // Refresh token carried over from the previous holder
    assert!(binding.has_refresh_token);

    assert_eq!(state.notifications.list_unacknowledged(o).await?.len(), 1);
    assert_eq!(usage(&state, o).await?.historical, 1);
    assert_eq!(usage(&state, b).await?.historical, 0);
    assert_eq!(usage(&state, b).await?.active, 1);
    Ok(())
}

#[tokio::test]
async fn stale_request_surfaces_the_actual_owner() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let (request_id, reference) = pending(
        state
            .guard
            .connect_at(connect_request(b, "x1", bundle("a-b", Some("r-b"), None)), t0())
            .await?,
    );

    // C proves the recorded identity and takes the account first
    state
        .guard
        .connect_at(
            connect_request(c, "x1", bundle("a-c", Some("r-c"), Some(OWNER_LABEL))),
            t0(),
        )
        .await?;

    let err = state
        .guard
        .coordinator()
        .confirm(&reference, b, t0() + Duration::seconds(10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SlotError::OwnerChangedConcurrently { actual_owner: Some(owner) } if owner == c
    ));

    let request = transfer_request(&state.db, request_id).await?.unwrap();
    assert_eq!(request.status(), Some(TransferRequestStatus::Expired));
    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, c);
    Ok(())
}

#[tokio::test]
async fn stale_expectation_is_rejected() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let mut request = connect_request(b, "x1", bundle("a-b", Some("r-b"), Some(OWNER_LABEL)));
    request.expected_current_owner = Some(None);
    let err = state.guard.connect_at(request, t0()).await.unwrap_err();

    assert!(matches!(
        err,
        SlotError::OwnerChangedConcurrently { actual_owner: Some(owner) } if owner == o
    ));
    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, o);
    Ok(())
}

#[tokio::test]
async fn concurrent_transfers_have_exactly_one_winner() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;

    let key = CryptoKey::new(CRYPTO_KEY.to_vec())?;
    let command = |new_owner_id: Uuid| -> Result<TransferCommand<'static>> {
        Ok(TransferCommand {
            provider: PROVIDER,
            external_account_id: "x1",
            new_owner_id,
            expected_old_owner_id: o,
            credentials: seal_credentials(&key, PROVIDER, "x1", &bundle("a", Some("r"), None))?,
            request_id: None,
            path: TransferPath::Automatic,
        })
    };

    let coordinator = state.guard.coordinator();
    let (first, second) = tokio::join!(
        coordinator.transfer(command(a)?, t0()),
        coordinator.transfer(command(b)?, t0())
    );
    let outcomes = [first?, second?];

    let winners: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            TransferOutcome::Success {
                binding,
                already_transferred: false,
                ..
            } => Some(binding.owner_id),
            _ => None,
        })
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0];

    let losers: Vec<Option<Uuid>> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            TransferOutcome::OwnerChanged { actual_owner } => Some(*actual_owner),
            _ => None,
        })
        .collect();
    assert_eq!(losers, vec![Some(winner)]);

    assert_eq!(binding_for(&state.db, "x1").await?.unwrap().owner_id, winner);
    assert_eq!(count_events(&state.db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_transfer_to_the_same_owner_short_circuits() -> Result<()> {
    let state = setup_state(3).await?;
    let (o, a) = (Uuid::new_v4(), Uuid::new_v4());
    owned_by(&state, o, "x1").await?;
    let key = CryptoKey::new(CRYPTO_KEY.to_vec())?;

    for expected_duplicate in [false, true] {
        let outcome = state
            .guard
            .coordinator()
            .transfer(
                TransferCommand {
                    provider: PROVIDER,
                    external_account_id: "x1",
                    new_owner_id: a,
                    expected_old_owner_id: o,
                    credentials: seal_credentials(
                        &key,
                        PROVIDER,
                        "x1",
                        &bundle("a", Some("r"), None),
                    )?,
                    request_id: None,
                    path: TransferPath::Automatic,
                },
                t0(),
            )
            .await?;
        assert!(matches!(
            outcome,
            TransferOutcome::Success { already_transferred, .. } if already_transferred == expected_duplicate
        ));
    }

    let binding = binding_for(&state.db, "x1").await?.unwrap();
    assert_eq!(binding.ownership_version, 1);
    assert_eq!(count_events(&state.db).await?, 1);
    assert_eq!(usage(&state, a).await?.active, 1);
    assert_eq!(usage(&state, o).await?.active, 0);
    Ok(())
}
