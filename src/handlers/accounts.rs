//! # Account Handlers
//!
//! Connect, disconnect, list and slot-usage endpoints for the acting owner.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, OwnerExtension, OwnerHeader};
use crate::error::ApiError;
use crate::server::AppState;
use crate::slots::{
    BindingDescriptor, ConnectOutcome, ConnectRequest, CredentialBundle, SlotUsage,
    normalize_provider,
};

/// Body for connecting or reconnecting an external account
#[derive(Deserialize, ToSchema)]
pub struct ConnectAccountRequest {
    pub external_account_id: String,
    /// Plan that selects the lifetime quota; defaults to the free plan
    #[serde(default)]
    pub plan: Option<String>,
    pub credentials: CredentialBundle,
    /// Optimistic ownership check. Omit to skip, `null` to require an
    /// unowned account, or an owner id the account must currently belong to.
    #[serde(default, deserialize_with = "present_or_null")]
    #[schema(value_type = Option<String>, format = Uuid)]
    pub expected_current_owner: Option<Option<Uuid>>,
}

/// Distinguishes an explicit `null` from a missing field
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<Uuid>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Uuid>::deserialize(deserializer).map(Some)
}

/// Details of a transfer awaiting confirmation
#[derive(Debug, Serialize, ToSchema)]
pub struct PendingTransfer {
    pub request_id: Uuid,
    /// Signed reference to pass to `POST /transfers/confirm`
    pub reference: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectAccountResponse {
    /// `connected`, `transferred` or `transfer_pending`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<BindingDescriptor>,
    /// True when an existing slot was reused
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_owner_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_transferred: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<PendingTransfer>,
}

impl ConnectAccountResponse {
    fn from_outcome(outcome: ConnectOutcome) -> (StatusCode, Self) {
        match outcome {
            ConnectOutcome::Connected {
                binding,
                reconnected,
            } => (
                StatusCode::OK,
                Self {
                    status: "connected".to_string(),
                    binding: Some(binding),
                    reconnected: Some(reconnected),
                    from_owner_id: None,
                    already_transferred: None,
                    transfer: None,
                },
            ),
            ConnectOutcome::Transferred {
                binding,
                from_owner_id,
                already_transferred,
            } => (
                StatusCode::OK,
                Self {
                    status: "transferred".to_string(),
                    binding: Some(binding),
                    reconnected: None,
                    from_owner_id,
                    already_transferred: Some(already_transferred),
                    transfer: None,
                },
            ),
            ConnectOutcome::TransferPending {
                request_id,
                reference,
                expires_at,
            } => (
                StatusCode::ACCEPTED,
                Self {
                    status: "transfer_pending".to_string(),
                    binding: None,
                    reconnected: None,
                    from_owner_id: None,
                    already_transferred: None,
                    transfer: Some(PendingTransfer {
                        request_id,
                        reference,
                        expires_at,
                    }),
                },
            ),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DisconnectAccountRequest {
    pub external_account_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccountsResponse {
    pub accounts: Vec<BindingDescriptor>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UsageQuery {
    /// Plan whose quota applies; defaults to the free plan
    pub plan: Option<String>,
}

/// Connect or reconnect an external account
///
/// Reuses the owner's existing slot for the account when there is one,
/// otherwise allocates a new slot against the lifetime quota. Accounts held by
/// another owner are transferred when the display identity matches, and
/// staged for confirmation otherwise.
#[utoipa::path(
    post,
    path = "/accounts/{provider}/connect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug, e.g. 'google'"),
        OwnerHeader
    ),
    request_body = ConnectAccountRequest,
    responses(
        (status = 200, description = "Account connected or transferred", body = ConnectAccountResponse),
        (status = 202, description = "Transfer staged; confirmation required", body = ConnectAccountResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 409, description = "Quota exceeded or ownership changed", body = ApiError),
        (status = 422, description = "Refresh token missing; re-authorize with consent", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn connect_account(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
    Path(provider): Path<String>,
    body: Result<Json<ConnectAccountRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ConnectAccountResponse>), ApiError> {
    let Json(body) = body?;

    let outcome = state
        .guard
        .connect(ConnectRequest {
            owner_id: owner.0,
            provider,
            external_account_id: body.external_account_id,
            plan: body.plan,
            credentials: body.credentials,
            expected_current_owner: body.expected_current_owner,
        })
        .await?;

    let (status, response) = ConnectAccountResponse::from_outcome(outcome);
    Ok((status, Json(response)))
}

/// Disconnect an external account
///
/// The slot stays counted against the lifetime quota and is reused if the
/// account is reconnected later.
#[utoipa::path(
    post,
    path = "/accounts/{provider}/disconnect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        OwnerHeader
    ),
    request_body = DisconnectAccountRequest,
    responses(
        (status = 200, description = "Account disconnected", body = BindingDescriptor),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "No binding for this owner", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn disconnect_account(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
    Path(provider): Path<String>,
    body: Result<Json<DisconnectAccountRequest>, JsonRejection>,
) -> Result<Json<BindingDescriptor>, ApiError> {
    let Json(body) = body?;
    let descriptor = state
        .guard
        .binding()
        .disconnect(owner.0, &provider, &body.external_account_id, Utc::now())
        .await?;
    Ok(Json(descriptor))
}

/// List the acting owner's bindings
#[utoipa::path(
    get,
    path = "/accounts",
    security(("bearer_auth" = [])),
    params(OwnerHeader),
    responses(
        (status = 200, description = "Bindings held by the owner", body = AccountsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn list_accounts(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
) -> Result<Json<AccountsResponse>, ApiError> {
    let accounts = state.guard.binding().list_for_owner(owner.0).await?;
    Ok(Json(AccountsResponse { accounts }))
}

/// Lifetime slot usage for a provider
#[utoipa::path(
    get,
    path = "/accounts/{provider}/usage",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider slug"),
        UsageQuery,
        OwnerHeader
    ),
    responses(
        (status = 200, description = "Historical and active slot counts", body = SlotUsage),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn slot_usage(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    OwnerExtension(owner): OwnerExtension,
    Path(provider): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<SlotUsage>, ApiError> {
    let provider = normalize_provider(&provider)?;
    let registry = state.guard.binding().registry();
    let limit = registry.quota_for(registry.plan_or_default(query.plan.as_deref()));
    let usage = registry.usage(owner.0, &provider, limit).await?;
    Ok(Json(usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_owner_distinguishes_null_from_absent() {
        let absent: ConnectAccountRequest = serde_json::from_value(serde_json::json!({
            "external_account_id": "acct",
            "credentials": {"access_token": "a"}
        }))
        .unwrap();
        assert_eq!(absent.expected_current_owner, None);

        let null: ConnectAccountRequest = serde_json::from_value(serde_json::json!({
            "external_account_id": "acct",
            "credentials": {"access_token": "a"},
            "expected_current_owner": null
        }))
        .unwrap();
        assert_eq!(null.expected_current_owner, Some(None));

        let owner = Uuid::new_v4();
        let some: ConnectAccountRequest = serde_json::from_value(serde_json::json!({
            "external_account_id": "acct",
            "credentials": {"access_token": "a"},
            "expected_current_owner": owner
        }))
        .unwrap();
        assert_eq!(some.expected_current_owner, Some(Some(owner)));
    }

    #[test]
    fn pending_outcome_maps_to_accepted() {
        let (status, response) = ConnectAccountResponse::from_outcome(
            ConnectOutcome::TransferPending {
                request_id: Uuid::new_v4(),
                reference: "ref.sig".into(),
                expires_at: Utc::now(),
            },
        );
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response.status, "transfer_pending");
        assert!(response.binding.is_none());
    }
}
