//! # WhatsApp Gateway HTTP Service
//!
//! HTTP surface of the gateway.
//!
//! This service provides:
//! - WhatsApp webhook endpoint with signature validation
//! - Webhook subscription handshake
//! - API-key protected endpoints to send and list messages and contacts
//! - Health and Prometheus metrics endpoints

pub mod config;
pub mod errors;
pub mod metrics;
pub mod responses;

pub use config::{AuthConfig, LoggingConfig, ServerConfig, ServiceConfig, WhatsAppConfig};
pub use errors::{ApiError, ConfigError, ServiceError, WebhookHandlerError};
pub use metrics::ServiceMetrics;

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use metrics::outcome;
use responses::{
    ContactListParams, HealthResponse, ListResponse, MessageListParams, VerifyParams,
    WebhookResponse,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};
use wa_gateway_core::{
    storage::MessageFilter, webhook::SIGNATURE_HEADER, ApiKey, ApiKeyAuthenticator, Contact,
    IngestionCoordinator, IngestionError, Message, MessageSender, MessageStateMachine,
    MessageStatus, MessageStore, OutboundDispatcher, Pagination, Permission, PhoneNumber,
    RecordId, SendMessageRequest, Timestamp,
};

/// Header carrying a plaintext API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header used to correlate log lines of one request
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: Arc<ServiceConfig>,

    pub store: Arc<dyn MessageStore>,

    /// Verifies and applies webhook deliveries
    pub ingestion: Arc<IngestionCoordinator>,

    pub authenticator: ApiKeyAuthenticator,

    /// Absent when the service has no sender or business number
    pub dispatcher: Option<OutboundDispatcher>,

    /// Metrics collector for observability
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    /// Wire the core components from configuration.
    ///
    /// Outbound sending is enabled only when both a sender and a business
    /// phone number are available.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn MessageStore>,
        sender: Option<Arc<dyn MessageSender>>,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self, ConfigError> {
        let business_number = config
            .whatsapp
            .business_phone_number
            .as_deref()
            .map(PhoneNumber::normalize)
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                message: format!("whatsapp.business_phone_number: {}", e),
            })?;

        if config.whatsapp.webhook_secret().is_none() {
            warn!("No webhook secret configured; every webhook delivery will be rejected");
        }

        let state_machine = MessageStateMachine::new(store.clone(), business_number.clone());
        let ingestion = IngestionCoordinator::new(config.whatsapp.webhook_secret(), state_machine);

        let dispatcher = match (sender, business_number) {
            (Some(sender), Some(number)) => {
                Some(OutboundDispatcher::new(store.clone(), sender, number))
            }
            (Some(_), None) => {
                warn!("No business phone number configured; outbound sending disabled");
                None
            }
            (None, _) => {
                info!("No message sender configured; outbound sending disabled");
                None
            }
        };

        Ok(Self {
            config: Arc::new(config),
            authenticator: ApiKeyAuthenticator::new(store.clone()),
            store,
            ingestion: Arc::new(ingestion),
            dispatcher,
            metrics,
        })
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes =
        Router::new().route("/webhook", post(handle_webhook).get(handle_webhook_verification));

    let api_routes = Router::new()
        .route("/api/messages", post(send_message).get(list_messages))
        .route("/api/messages/{message_id}", get(get_message))
        .route("/api/contacts", get(list_contacts));

    let health_routes = Router::new().route("/health", get(handle_health_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    let server = &state.config.server;
    let mut router = Router::new()
        .merge(webhook_routes)
        .merge(api_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .layer(DefaultBodyLimit::max(server.max_body_size));

    if server.enable_compression {
        router = router.layer(CompressionLayer::new());
    }
    if server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_logging_middleware))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .into_inner(),
        )
        .with_state(state)
}

/// Start HTTP server and run until SIGINT or SIGTERM
pub async fn start_server(state: AppState) -> Result<(), ServiceError> {
    let server_config = state.config.server.clone();
    let address = format!("{}:{}", server_config.host, server_config.port);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind((server_config.host.as_str(), server_config.port))
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!(address = %address, "Starting HTTP server");

    let shutdown_timeout = std::time::Duration::from_secs(server_config.shutdown_timeout_seconds);
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();

    let serve = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!(
                    timeout_seconds = shutdown_timeout.as_secs(),
                    "Initiating graceful shutdown"
                );
                let _ = signalled_tx.send(());
            })
            .await
    };

    // In-flight requests get the configured grace period once a signal arrives
    let deadline = async move {
        if signalled_rx.await.is_ok() {
            tokio::time::sleep(shutdown_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = serve => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
        }
        _ = deadline => {
            warn!("Graceful shutdown timed out; abandoning in-flight requests");
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Handle WhatsApp webhook deliveries
///
/// Responds 200 once the delivery is verified and parsed, even when single
/// events were rejected or referenced unknown messages. A storage failure on
/// any event yields 500 so the provider redelivers.
/// Message events are applied before status events, so a status for a
/// message in the same delivery finds it.
#[instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.ingestion.handle_webhook(&body, signature).await {
        Ok(report) => {
            state.metrics.record_webhook(outcome::ACCEPTED, Some(&report));
            Ok(Json(WebhookResponse::from(&report)))
        }
        Err(e) => {
            let outcome = match &e {
                IngestionError::Unauthorized { .. } => outcome::UNAUTHORIZED,
                IngestionError::BadRequest(_) => outcome::BAD_REQUEST,
                IngestionError::Database { .. } => outcome::STORAGE_FAILURE,
            };
            state.metrics.record_webhook(outcome, e.report());
            Err(e.into())
        }
    }
}

/// Answer the subscription handshake by echoing `hub.challenge`
#[instrument(skip_all)]
async fn handle_webhook_verification(
    State(state): State<AppState>,
    Query(params): Query<VerifyParams>,
) -> Result<String, WebhookHandlerError> {
    let expected = state
        .config
        .whatsapp
        .verify_token
        .as_deref()
        .filter(|t| !t.is_empty());

    match (
        params.mode.as_deref(),
        params.verify_token.as_deref(),
        expected,
        params.challenge,
    ) {
        (Some("subscribe"), Some(provided), Some(expected), Some(challenge))
            if provided == expected =>
        {
            info!("Webhook subscription verified");
            Ok(challenge)
        }
        _ => Err(WebhookHandlerError::VerificationFailed),
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// Plaintext key from `X-API-Key` or `Authorization: Bearer`
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    let from_header = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());
    if from_header.is_some() {
        return from_header;
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

async fn require_permission(
    state: &AppState,
    headers: &HeaderMap,
    permission: Permission,
) -> Result<ApiKey, ApiError> {
    let Some(plaintext) = extract_api_key(headers) else {
        state.metrics.authentication_failures_total.inc();
        return Err(ApiError::Unauthorized);
    };

    let key = match state.authenticator.authenticate(plaintext).await {
        Ok(key) => key,
        Err(e) => {
            if matches!(e, wa_gateway_core::AuthError::Unauthorized) {
                state.metrics.authentication_failures_total.inc();
            }
            return Err(e.into());
        }
    };

    if !state.authenticator.authorize(&key, permission) {
        return Err(ApiError::Forbidden { permission });
    }
    Ok(key)
}

/// Queue an outbound message; delivery continues in the background
#[instrument(skip(state, headers, body))]
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let key = require_permission(&state, &headers, Permission::SendMessage).await?;

    let Some(dispatcher) = &state.dispatcher else {
        return Err(ApiError::ServiceUnavailable {
            message: "Outbound messaging is not configured".to_string(),
        });
    };

    let request: SendMessageRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest {
            message: format!("Invalid request body: {}", e),
        })?;

    let dispatched = dispatcher.dispatch(&request).await?;
    state.metrics.record_outbound(outcome::QUEUED);

    info!(
        key_name = %key.name,
        message_id = ?dispatched.message.id,
        "Accepted outbound message"
    );

    let metrics = state.metrics.clone();
    let delivery = dispatched.delivery;
    tokio::spawn(async move {
        let result = match delivery.await {
            Ok(Some(message)) if message.status == MessageStatus::Sent => outcome::SENT,
            Ok(Some(_)) => outcome::FAILED,
            Ok(None) => outcome::NOT_RECORDED,
            Err(e) => {
                error!(error = %e, "Outbound delivery task panicked");
                outcome::NOT_RECORDED
            }
        };
        metrics.record_outbound(result);
    });

    Ok((StatusCode::ACCEPTED, Json(dispatched.message)))
}

#[instrument(skip(state, headers))]
async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<MessageListParams>,
) -> Result<Json<ListResponse<Message>>, ApiError> {
    require_permission(&state, &headers, Permission::ReadMessages).await?;

    let filter = MessageFilter {
        phone_number: params
            .phone_number
            .as_deref()
            .map(PhoneNumber::normalize)
            .transpose()?,
        direction: params.direction.as_deref().map(str::parse).transpose()?,
        status: params.status.as_deref().map(str::parse).transpose()?,
    };

    let page = state
        .store
        .list_messages(&filter, Pagination::new(params.limit, params.offset))
        .await?;
    Ok(Json(page.into()))
}

#[instrument(skip(state, headers))]
async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    require_permission(&state, &headers, Permission::ReadMessages).await?;

    let id = RecordId::new(message_id)?;
    state
        .store
        .get_message(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound {
            entity: "message".to_string(),
            id: id.to_string(),
        })
}

#[instrument(skip(state, headers))]
async fn list_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ContactListParams>,
) -> Result<Json<ListResponse<Contact>>, ApiError> {
    require_permission(&state, &headers, Permission::ReadContacts).await?;

    let page = state
        .store
        .list_contacts(Pagination::new(params.limit, params.offset))
        .await?;
    Ok(Json(page.into()))
}

// ============================================================================
// Health and Metrics Handlers
// ============================================================================

#[instrument(skip(state))]
async fn handle_health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, label) = match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            warn!(error = %e, "Storage health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: state.config.environment.as_str().to_string(),
            timestamp: Timestamp::now(),
        }),
    )
}

#[instrument(skip_all)]
async fn metrics_endpoint(
    State(state): State<AppState>,
) -> Result<([(header::HeaderName, &'static str); 1], String), ApiError> {
    let body = state.metrics.render().map_err(|e| ApiError::Internal {
        message: format!("Failed to render metrics: {}", e),
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware with correlation ID tracking
///
/// Reuses an incoming `x-correlation-id` or generates one, and echoes it on
/// the response.
#[instrument(skip(request, next), fields(
    method = %request.method(),
    uri = %request.uri(),
    correlation_id
))]
async fn request_logging_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("correlation_id", correlation_id.as_str());
    request.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(request).await;
    let duration = start.elapsed();

    if let Ok(header_value) = correlation_id.parse() {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    let status = response.status();
    if status.is_server_error() {
        error!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        warn!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        info!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed"
        );
    }

    response
}

/// Records request counts and latency labelled by route template
async fn metrics_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let start = std::time::Instant::now();
    let method = request.method().to_string();

    // Route templates keep label cardinality bounded
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    state.metrics.record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
