//! Background expiry of overdue transfer requests.

use account_slots::models::transfer_request::TransferRequestStatus;
use account_slots::slots::{ConnectOutcome, TransferRequestSweeper};
use anyhow::Result;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

async fn staged_request(state: &account_slots::server::AppState) -> Result<Uuid> {
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());
    state
        .guard
        .connect_at(connect_request(o, "x1", bundle("a", Some("r"), None)), t0())
        .await?;
    match state
        .guard
        .connect_at(connect_request(b, "x1", bundle("b", Some("r"), None)), t0())
        .await?
    {
        ConnectOutcome::TransferPending { request_id, .. } => Ok(request_id),
        other => panic!("expected TransferPending, got {other:?}"),
    }
}

#[tokio::test]
async fn sweep_expires_only_overdue_requests() -> Result<()> {
    let state = setup_state(3).await?;
    let request_id = staged_request(&state).await?;
    let sweeper = TransferRequestSweeper::new(state.db.clone(), 60);

    assert_eq!(sweeper.sweep_once(t0() + Duration::seconds(599)).await?, 0);
    assert_eq!(
        transfer_request(&state.db, request_id).await?.unwrap().status(),
        Some(TransferRequestStatus::Pending)
    );

    assert_eq!(sweeper.sweep_once(t0() + Duration::seconds(600)).await?, 1);
    assert_eq!(
        transfer_request(&state.db, request_id).await?.unwrap().status(),
        Some(TransferRequestStatus::Expired)
    );

    // Nothing left to do on the next pass
    assert_eq!(sweeper.sweep_once(t0() + Duration::seconds(900)).await?, 0);
    Ok(())
}

#[tokio::test]
async fn run_stops_on_cancellation() -> Result<()> {
    let state = setup_state(3).await?;
    let sweeper = TransferRequestSweeper::new(state.db.clone(), 3600);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    tokio::time::timeout(std::time::Duration::from_secs(5), sweeper.run(shutdown)).await?;
    Ok(())
}
