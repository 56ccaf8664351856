//! # Server Configuration
//!
//! Router, shared state and process lifecycle for the account slot service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::db::{health_check, init_pool};
use crate::handlers;
use crate::slots::{
    AccountBinding, ConcurrencyGuard, NotificationLedger, OwnershipTransferCoordinator,
    RecordedLabelVerifier, SlotRegistry, TransferReferenceSigner, TransferRequestSweeper,
};
use crate::telemetry::{TraceContext, with_trace_context};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub guard: ConcurrencyGuard,
    pub notifications: NotificationLedger,
}

impl AppState {
    /// Wires the slot engine from configuration
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection) -> anyhow::Result<Self> {
        let db = Arc::new(db);

        let crypto_key = CryptoKey::new(
            config
                .crypto_key
                .clone()
                .context("SLOTS_CRYPTO_KEY is required")?,
        )
        .context("invalid SLOTS_CRYPTO_KEY")?;
        let signer = TransferReferenceSigner::new(
            config
                .transfer_signing_key
                .clone()
                .context("SLOTS_TRANSFER_SIGNING_KEY is required")?,
        );

        let registry = SlotRegistry::new(Arc::clone(&db), config.slots.clone());
        let binding = AccountBinding::new(Arc::clone(&db), crypto_key, registry);
        let notifications = NotificationLedger::new(Arc::clone(&db));
        let coordinator = OwnershipTransferCoordinator::new(
            Arc::clone(&db),
            binding.clone(),
            notifications.clone(),
            signer,
            config.transfers.ttl_seconds,
        );
        let guard = ConcurrencyGuard::new(
            Arc::clone(&db),
            binding,
            coordinator,
            Arc::new(RecordedLabelVerifier),
        );

        Ok(Self {
            config,
            db,
            guard,
            notifications,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/accounts", get(handlers::accounts::list_accounts))
        .route(
            "/accounts/{provider}/connect",
            post(handlers::accounts::connect_account),
        )
        .route(
            "/accounts/{provider}/disconnect",
            post(handlers::accounts::disconnect_account),
        )
        .route(
            "/accounts/{provider}/usage",
            get(handlers::accounts::slot_usage),
        )
        .route(
            "/transfers/confirm",
            post(handlers::transfers::confirm_transfer),
        )
        .route(
            "/notifications",
            get(handlers::notifications::list_notifications),
        )
        .route(
            "/notifications/{id}/ack",
            post(handlers::notifications::acknowledge_notification),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Assigns a trace ID to each request, honouring an inbound `x-request-id`
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = TraceContext {
        trace_id: trace_id.clone(),
    };
    request.extensions_mut().insert(context.clone());

    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let db = init_pool(&config).await?;
    health_check(&db).await?;

    if config.auto_migrate {
        info!("Applying pending migrations");
        Migrator::up(&db, None)
            .await
            .context("failed to apply migrations")?;
    }

    let state = AppState::new(Arc::clone(&config), db)?;

    let shutdown = CancellationToken::new();
    let sweeper = TransferRequestSweeper::new(
        Arc::clone(&state.db),
        config.transfers.sweep_interval_seconds,
    );
    let sweeper_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    let app = create_app(state);

    let addr = config.bind_addr().context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(err) = sweeper_task.await {
        tracing::warn!(error = %err, "Sweeper task ended abnormally");
    }

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
    }
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::accounts::connect_account,
        crate::handlers::accounts::disconnect_account,
        crate::handlers::accounts::list_accounts,
        crate::handlers::accounts::slot_usage,
        crate::handlers::transfers::confirm_transfer,
        crate::handlers::notifications::list_notifications,
        crate::handlers::notifications::acknowledge_notification,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::slots::BindingDescriptor,
            crate::slots::SlotUsage,
            crate::slots::TransferNotice,
            crate::handlers::accounts::ConnectAccountRequest,
            crate::slots::CredentialBundle,
            crate::handlers::accounts::ConnectAccountResponse,
            crate::handlers::accounts::DisconnectAccountRequest,
            crate::handlers::accounts::AccountsResponse,
            crate::handlers::transfers::ConfirmTransferRequest,
            crate::handlers::transfers::ConfirmTransferResponse,
            crate::handlers::notifications::NotificationsResponse,
        )
    ),
    modifiers(&BearerAuthAddon),
    info(
        title = "Account Slots API",
        description = "Lifetime account slots, bindings and ownership transfers",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
