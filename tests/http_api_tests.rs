//! End-to-end HTTP flows over an in-memory database.

use account_slots::auth::OWNER_HEADER;
use account_slots::server::create_app;
use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    owner: Uuid,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {OPERATOR_TOKEN}"))
        .header(OWNER_HEADER, owner.to_string());
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value)?)
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body)?).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, json))
}

fn connect_body(ext: &str, refresh: Option<&str>, label: Option<&str>) -> Value {
    json!({
        "external_account_id": ext,
        "credentials": {
            "access_token": "access",
            "refresh_token": refresh,
            "identity_label": label
        }
    })
}

#[tokio::test]
async fn connect_disconnect_and_quota_over_http() -> Result<()> {
    let app = create_app(setup_state(2).await?);
    let owner = Uuid::new_v4();

    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        owner,
        Some(connect_body("x1", Some("r1"), None)),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "connected");
    assert_eq!(body["reconnected"], false);
    assert_eq!(body["binding"]["sequence_number"], 1);
    assert!(body["binding"].get("access_token_ciphertext").is_none());

    let (status, _) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        owner,
        Some(connect_body("x2", Some("r2"), None)),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/disconnect",
        owner,
        Some(json!({"external_account_id": "x1"})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_active"], false);

    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        owner,
        Some(connect_body("x3", Some("r3"), None)),
    )
    .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "QUOTA_EXCEEDED");

    let (status, body) = send(&app, Method::GET, "/accounts/google/usage", owner, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["historical"], 2);
    assert_eq!(body["active"], 1);
    assert_eq!(body["limit"], 2);
    assert_eq!(body["remaining"], 0);

    // Reconnecting a known identity never needs a new slot
    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        owner,
        Some(connect_body("x1", None, None)),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reconnected"], true);
    assert_eq!(body["binding"]["has_refresh_token"], true);

    let (status, body) = send(&app, Method::GET, "/accounts", owner, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accounts"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test]
async fn staged_transfer_flow_over_http() -> Result<()> {
    let app = create_app(setup_state(3).await?);
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());

    send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        o,
        Some(connect_body("x1", Some("r"), Some("o@example.com"))),
    )
    .await?;

    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        b,
        Some(connect_body("x1", Some("rb"), Some("someone@example.com"))),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "transfer_pending");
    let reference = body["transfer"]["reference"]
        .as_str()
        .expect("reference present")
        .to_string();

    // Someone else holding the reference cannot use it
    let (status, _) = send(
        &app,
        Method::POST,
        "/transfers/confirm",
        Uuid::new_v4(),
        Some(json!({"reference": reference})),
    )
    .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/transfers/confirm",
        b,
        Some(json!({"reference": reference})),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_transferred"], false);
    assert_eq!(body["from_owner_id"], o.to_string());
    assert_eq!(body["binding"]["owner_id"], b.to_string());

    let (status, body) = send(&app, Method::GET, "/notifications", o, None).await?;
    assert_eq!(status, StatusCode::OK);
    let notices = body["notifications"].as_array().cloned().unwrap_or_default();
    assert_eq!(notices.len(), 1);
    let notice_id = notices[0]["id"].as_str().expect("notice id").to_string();

    let uri = format!("/notifications/{notice_id}/ack");
    let (status, body) = send(&app, Method::POST, &uri, o, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["acknowledged_at"].is_string());

    let (status, _) = send(&app, Method::POST, &uri, b, None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, Method::GET, "/notifications", o, None).await?;
    assert_eq!(body["notifications"], json!([]));
    Ok(())
}

#[tokio::test]
async fn expected_owner_mismatch_is_a_conflict() -> Result<()> {
    let app = create_app(setup_state(3).await?);
    let (o, b) = (Uuid::new_v4(), Uuid::new_v4());

    send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        o,
        Some(connect_body("x1", Some("r"), None)),
    )
    .await?;

    let mut body = connect_body("x1", Some("rb"), None);
    body["expected_current_owner"] = Value::Null;
    let (status, response) =
        send(&app, Method::POST, "/accounts/google/connect", b, Some(body)).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["code"], "OWNER_CHANGED");
    Ok(())
}

#[tokio::test]
async fn first_connect_without_refresh_token_is_unprocessable() -> Result<()> {
    let app = create_app(setup_state(3).await?);
    let (status, body) = send(
        &app,
        Method::POST,
        "/accounts/google/connect",
        Uuid::new_v4(),
        Some(connect_body("x1", None, None)),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "TOKEN_MISSING");
    Ok(())
}

#[tokio::test]
async fn missing_owner_header_is_rejected() -> Result<()> {
    let app = create_app(setup_state(3).await?);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/accounts")
                .header("authorization", format!("Bearer {OPERATOR_TOKEN}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}
