//! # Transfer Handlers
//!
//! Confirmation endpoint for staged ownership transfers.

use axum::{
    extract::{State, rejection::JsonRejection},
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, OwnerExtension, OwnerHeader};
use crate::error::{ApiError, SlotError};
use crate::server::AppState;
use crate::slots::{BindingDescriptor, TransferOutcome};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmTransferRequest {
    /// Signed reference returned when the transfer was staged
    pub reference: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConfirmTransferResponse {
    pub binding: BindingDescriptor,
    pub from_owner_id: Option<Uuid>,
    /// True when this transfer had already completed
    pub already_transferred: bool,
}

/// Confirm a staged transfer
///
/// Only the owner that staged the request may confirm it, and only before it
/// expires.
#[utoipa::path(
    post,
    path = "/transfers/confirm",
    security(("bearer_auth" = [])),
    params(OwnerHeader),
    request_body = ConfirmTransferRequest,
    responses(
        (status = 200, description = "Ownership transferred", body = ConfirmTransferResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Unknown or foreign transfer reference", body = ApiError),
        (status = 409, description = "Account changed hands since staging", body = ApiError),
        (status = 410, description = "Transfer request expired", body = ApiError)
    ),
    tag = "transfers"
)]
pub async fn confirm_transfer(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
    body: Result<Json<ConfirmTransferRequest>, JsonRejection>,
) -> Result<Json<ConfirmTransferResponse>, ApiError> {
    let Json(body) = body?;

    let outcome = state
        .guard
        .coordinator()
        .confirm(body.reference.trim(), owner.0, Utc::now())
        .await?;

    match outcome {
        TransferOutcome::Success {
            binding,
            from_owner_id,
            already_transferred,
        } => Ok(Json(ConfirmTransferResponse {
            binding,
            from_owner_id,
            already_transferred,
        })),
        TransferOutcome::OwnerChanged { actual_owner } => {
            Err(SlotError::OwnerChangedConcurrently { actual_owner }.into())
        }
    }
}
