mod adapters;
mod app;
mod domain;
mod ports;
mod telemetry;

pub use app::bridge::ReconnectPolicy;

use adapters::evolution::{
    EvolutionClientFactory, EvolutionConfig, EvolutionWebhookHub, WebhookOutcome,
};
use adapters::session::{open_database, SqliteAuthStateRepository, SqliteSessionKeyRepository};
use anyhow::{anyhow, bail, Context};
use app::bridge::{
    BridgeConfig, BridgeError, BridgeService, BridgeStores, ObserverMessage, SendMessageRequest,
    StatusReport,
};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use domain::session::SessionName;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const STATUS_PAGE: &str = include_str!("status_page.html");

#[derive(Clone)]
struct AppState {
    bridge: Arc<BridgeService>,
    webhooks: Arc<EvolutionWebhookHub>,
}

impl AppState {
    fn new(bridge: Arc<BridgeService>, webhooks: Arc<EvolutionWebhookHub>) -> Self {
        Self { bridge, webhooks }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub session_id: String,
    pub gateway_url: String,
    pub gateway_api_key: String,
    pub instance_name: String,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub gateway_poll_interval: Duration,
    pub auth_backup_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: String::new(),
            session_id: "whatsapp".to_string(),
            gateway_url: String::new(),
            gateway_api_key: String::new(),
            instance_name: "wabridge".to_string(),
            webhook_url: None,
            webhook_token: None,
            gateway_poll_interval: Duration::from_millis(5_000),
            auth_backup_interval: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
            otlp_endpoint: None,
        }
    }
}

impl Settings {
    fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            bail!("a database URL is required (--database-url or WABRIDGE_DATABASE_URL)");
        }
        if self.gateway_url.trim().is_empty() {
            bail!("a gateway URL is required (--gateway-url or EVOLUTION_API_URL)");
        }
        if self.gateway_api_key.trim().is_empty() {
            bail!("a gateway API key is required (--gateway-api-key or EVOLUTION_API_KEY)");
        }
        if self.gateway_poll_interval.is_zero() || self.auth_backup_interval.is_zero() {
            bail!("gateway poll and auth backup intervals must be positive");
        }
        Ok(())
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let listener = TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("binding {}:{}", settings.host, settings.port))?;
    serve(listener, settings, shutdown_signal()).await
}

/// Runs the bridge on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, settings: Settings, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    settings.validate()?;
    let session_id = SessionName::new(settings.session_id.clone()).map_err(|err| anyhow!(err))?;

    let (metrics, provider) = if let Some(ref endpoint) = settings.otlp_endpoint {
        let (provider, metrics) = telemetry::init_metrics(endpoint, "wabridged")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let database = open_database(&settings.database_url).context("opening session database")?;
    let stores = BridgeStores {
        keys: Arc::new(SqliteSessionKeyRepository::new(database.clone())),
        auth: Arc::new(SqliteAuthStateRepository::new(database)),
    };

    let webhooks = Arc::new(EvolutionWebhookHub::new(
        settings.instance_name.clone(),
        settings.webhook_token.clone(),
    ));
    let gateway = EvolutionConfig::new(
        settings.gateway_url.clone(),
        settings.gateway_api_key.clone(),
        settings.instance_name.clone(),
    )
    .with_webhook_url(settings.webhook_url.clone())
    .with_poll_interval(settings.gateway_poll_interval);
    info!(?gateway, "chat gateway configured");
    let factory = EvolutionClientFactory::new(gateway, Arc::clone(&webhooks))?;

    let bridge = BridgeService::start(
        BridgeConfig {
            session_id,
            reconnect: settings.reconnect.clone(),
            auth_backup_interval: settings.auth_backup_interval,
        },
        stores,
        Arc::new(factory),
        metrics,
    );

    let app = router(AppState::new(Arc::clone(&bridge), webhooks));
    let local = listener.local_addr()?;
    info!("listening" = %local, "session" = %settings.session_id, "msg" = "wabridged started");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await;

    bridge.shutdown().await;

    if let Some(provider) = provider {
        if let Err(e) = telemetry::shutdown_metrics(provider) {
            warn!("Failed to shutdown telemetry: {}", e);
        }
    }

    served?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/healthz", get(health))
        .route("/status", get(status))
        .route("/send-message", post(send_message))
        .route("/logout", post(logout))
        .route("/ws", get(observer_ws_upgrade))
        .route("/webhook/evolution", post(evolution_webhook))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("msg" = "shutdown signal received");
}

async fn status_page() -> Html<&'static str> {
    Html(STATUS_PAGE)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.bridge.status_report().await;
    let (code, status) = if state.bridge.is_healthy().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "failed")
    };
    (
        code,
        Json(json!({
            "status": status,
            "state": report.state,
            "ready": report.ready,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.bridge.status_report().await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    success: bool,
    message_id: String,
    response: Value,
}

/// The key is checked against the raw body before any field typing, so a wrong
/// key answers 403 whatever else the payload carries.
async fn send_message(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let presented = payload
        .get("apiKey")
        .and_then(Value::as_str)
        .unwrap_or_default();
    state
        .bridge
        .authorize(presented)
        .await
        .map_err(bridge_error_to_api)?;
    let request: SendMessageRequest = serde_json::from_value(payload)
        .map_err(|err| ApiError::invalid("invalid_request", err.to_string()))?;
    let receipt = state
        .bridge
        .send_message(request)
        .await
        .map_err(bridge_error_to_api)?;
    Ok(Json(SendMessageResponse {
        success: true,
        message_id: receipt.id,
        response: receipt.raw,
    }))
}

async fn logout(State(state): State<AppState>) -> Json<Value> {
    state.bridge.logout().await;
    Json(json!({
        "success": true,
        "message": "logged out; a new pairing session has been scheduled",
    }))
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    token: Option<String>,
}

async fn evolution_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !state.webhooks.verify_token(query.token.as_deref()) {
        return Err(ApiError::forbidden(
            "invalid_webhook_token",
            "webhook token missing or wrong",
        ));
    }
    let body = match state.webhooks.dispatch(&payload).await {
        WebhookOutcome::Delivered(events) => json!({"status": "delivered", "events": events}),
        WebhookOutcome::Ignored(reason) => {
            debug!(reason, "webhook delivery ignored");
            json!({"status": "ignored", "reason": reason})
        }
    };
    Ok(Json(body))
}

async fn observer_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_observer_socket(socket, state.bridge).await {
            debug!("observer session ended: {err:#}");
        }
    })
}

async fn handle_observer_socket(
    mut socket: WebSocket,
    bridge: Arc<BridgeService>,
) -> anyhow::Result<()> {
    let (initial, mut updates) = bridge.subscribe().await;
    for frame in &initial {
        send_frame(&mut socket, frame).await?;
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(frame) => send_frame(&mut socket, &frame).await?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagging; resending status");
                    let fresh = ObserverMessage::Status(bridge.status_snapshot().await);
                    send_frame(&mut socket, &fresh).await?;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("observer receive error: {err}");
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn send_frame(socket: &mut WebSocket, frame: &ObserverMessage) -> anyhow::Result<()> {
    let payload = serde_json::to_string(frame)?;
    socket.send(Message::Text(payload)).await?;
    Ok(())
}

fn bridge_error_to_api(err: BridgeError) -> ApiError {
    let message = err.to_string();
    match err {
        BridgeError::InvalidApiKey => ApiError::forbidden("invalid_api_key", message),
        BridgeError::NotReady => ApiError::unavailable("client_not_ready", message),
        BridgeError::MissingFields(_) => ApiError::invalid("missing_fields", message),
        BridgeError::InvalidPhoneNumber(_) => ApiError::invalid("invalid_phone_number", message),
        BridgeError::UnknownRecipient(_) => ApiError::invalid("unknown_recipient", message),
        BridgeError::Dispatch(_) => ApiError::internal("dispatch_failed", anyhow!(message)),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn invalid(code: &'static str, err: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code,
                message: err.into(),
            },
        }
    }

    fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn internal(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                code,
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        let body = Json(self.body);
        (status, body).into_response()
    }
}
