//! # Notification Handlers
//!
//! Transfer notices for owners who lost an account to someone else.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, OwnerExtension, OwnerHeader};
use crate::error::ApiError;
use crate::server::AppState;
use crate::slots::TransferNotice;

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationsResponse {
    pub notifications: Vec<TransferNotice>,
}

/// List unacknowledged transfer notices
#[utoipa::path(
    get,
    path = "/notifications",
    security(("bearer_auth" = [])),
    params(OwnerHeader),
    responses(
        (status = 200, description = "Unacknowledged notices, oldest first", body = NotificationsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "notifications"
)]
pub async fn list_notifications(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
) -> Result<Json<NotificationsResponse>, ApiError> {
    let notifications = state.notifications.list_unacknowledged(owner.0).await?;
    Ok(Json(NotificationsResponse { notifications }))
}

/// Acknowledge a transfer notice
///
/// Acknowledging an already acknowledged notice succeeds without changes.
#[utoipa::path(
    post,
    path = "/notifications/{id}/ack",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Notice identifier"),
        OwnerHeader
    ),
    responses(
        (status = 200, description = "Notice acknowledged", body = TransferNotice),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No such notice for this owner", body = ApiError)
    ),
    tag = "notifications"
)]
pub async fn acknowledge_notification(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferNotice>, ApiError> {
    state
        .notifications
        .acknowledge(owner.0, id, Utc::now())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "notification not found"))
}
