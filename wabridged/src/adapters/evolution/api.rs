use super::config::EvolutionConfig;
use super::webhook::{extract_qr, EvolutionWebhookHub};
use crate::domain::session::{ChatId, PairingQr, PhoneNumber};
use crate::ports::chat::{
    ChatClient, ChatClientError, ChatClientFactory, ClientEvent, ClientEventSink, IncomingCall,
    MessageReceipt, RemoteAuth,
};
use crate::ports::session::AuthState;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

const INTEGRATION: &str = "WHATSAPP-BAILEYS";
const WEBHOOK_EVENTS: &[&str] = &["QRCODE_UPDATED", "CONNECTION_UPDATE", "CALL"];
const BODY_PREVIEW: usize = 300;
const INSTANCE_SETTINGS: &[&str] = &[
    "rejectCall",
    "msgCall",
    "groupsIgnore",
    "alwaysOnline",
    "readMessages",
    "readStatus",
    "syncFullHistory",
];

/// Credentials the gateway issued for our instance; persisted through the remote auth store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceCredentials {
    instance_name: String,
    token: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    synced_at: Option<DateTime<Utc>>,
}

pub struct EvolutionClientFactory {
    config: EvolutionConfig,
    http: reqwest::Client,
    hub: Arc<EvolutionWebhookHub>,
}

impl EvolutionClientFactory {
    pub fn new(config: EvolutionConfig, hub: Arc<EvolutionWebhookHub>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, http, hub })
    }
}

impl ChatClientFactory for EvolutionClientFactory {
    fn create(
        &self,
        auth: RemoteAuth,
        events: ClientEventSink,
    ) -> Result<Arc<dyn ChatClient>, ChatClientError> {
        Ok(Arc::new(EvolutionClient {
            inner: Arc::new(ClientInner {
                config: self.config.clone(),
                http: self.http.clone(),
                auth,
                events,
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                credentials: Mutex::new(None),
                last_qr: Mutex::new(None),
            }),
            hub: Arc::clone(&self.hub),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

struct ClientInner {
    config: EvolutionConfig,
    http: reqwest::Client,
    auth: RemoteAuth,
    events: ClientEventSink,
    connected: AtomicBool,
    closed: AtomicBool,
    credentials: Mutex<Option<InstanceCredentials>>,
    last_qr: Mutex<Option<PairingQr>>,
}

/// One gateway-backed client instance, bound to a single generation.
pub struct EvolutionClient {
    inner: Arc<ClientInner>,
    hub: Arc<EvolutionWebhookHub>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn preview(text: &str) -> &str {
    let mut end = text.len().min(BODY_PREVIEW);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn is_instance_conflict(status: u16, body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    matches!(status, 400 | 403 | 409)
        && (lower.contains("already") || lower.contains("exists"))
}

/// Keeps the operator's instance settings and turns call rejection on.
fn call_rejection_settings(current: &Value) -> Value {
    let current = current
        .get("settings")
        .filter(|nested| nested.is_object())
        .unwrap_or(current);
    let mut merged = serde_json::Map::new();
    for key in INSTANCE_SETTINGS {
        if let Some(value) = current.get(*key).filter(|v| !v.is_null()) {
            merged.insert((*key).to_string(), value.clone());
        }
    }
    merged.insert("rejectCall".into(), Value::Bool(true));
    merged
        .entry("msgCall")
        .or_insert_with(|| Value::String(String::new()));
    Value::Object(merged)
}

fn parse_message_timestamp(value: &Value) -> DateTime<Utc> {
    let secs = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
    secs.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

impl ClientInner {
    fn ensure_open(&self) -> Result<(), ChatClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatClientError::Closed);
        }
        Ok(())
    }

    async fn call(&self, request: RequestBuilder) -> Result<Value, ChatClientError> {
        let response = request
            .header("apikey", &self.config.api_key)
            .send()
            .await
            .map_err(|err| ChatClientError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ChatClientError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ChatClientError::Gateway {
                status: status.as_u16(),
                body: preview(&text).to_string(),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| ChatClientError::Protocol(err.to_string()))
    }

    async fn create_instance(&self, token: &str) -> Result<Value, ChatClientError> {
        let mut body = json!({
            "instanceName": self.config.instance_name,
            "token": token,
            "qrcode": true,
            "integration": INTEGRATION,
            "rejectCall": true,
            "msgCall": "",
        });
        if let Some(url) = &self.config.webhook_url {
            body["webhook"] = json!({
                "url": url,
                "byEvents": false,
                "base64": true,
                "events": WEBHOOK_EVENTS,
            });
        }
        self.call(
            self.http
                .post(self.config.endpoint("instance/create"))
                .json(&body),
        )
        .await
    }

    async fn connect_instance(&self) -> Result<Value, ChatClientError> {
        self.call(self.http.get(self.config.instance_endpoint("instance/connect")))
            .await
    }

    async fn connection_state(&self) -> Result<String, ChatClientError> {
        let body = self
            .call(
                self.http
                    .get(self.config.instance_endpoint("instance/connectionState")),
            )
            .await?;
        body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ChatClientError::Protocol("connection state missing".into()))
    }

    fn current_credentials(&self) -> Option<InstanceCredentials> {
        self.credentials.lock().ok().and_then(|guard| guard.clone())
    }

    async fn persist_credentials(&self, state: &str) {
        let Some(mut credentials) = self.current_credentials() else {
            return;
        };
        credentials.state = Some(state.to_string());
        credentials.synced_at = Some(Utc::now());
        let payload = match serde_json::to_value(&credentials) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "encoding gateway credentials failed");
                return;
            }
        };
        if let Err(err) = self
            .auth
            .store
            .save(AuthState::new(self.auth.session_id.clone(), payload))
            .await
        {
            warn!(%err, "auth state backup failed");
        }
    }

    async fn stored_credentials(&self) -> Option<InstanceCredentials> {
        match self.auth.store.load(&self.auth.session_id).await {
            Ok(Some(state)) => match serde_json::from_value::<InstanceCredentials>(state.payload) {
                Ok(credentials) if credentials.instance_name == self.config.instance_name => {
                    Some(credentials)
                }
                Ok(_) => {
                    info!("stored auth state belongs to another instance; pairing anew");
                    None
                }
                Err(err) => {
                    warn!(%err, "stored auth state unreadable; pairing anew");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "loading auth state failed; pairing anew");
                None
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            self.events.emit(event);
        }
    }

    /// Reports the pairing or open state found in a create/connect response.
    fn announce(&self, response: &Value) {
        let state = response["instance"]["state"]
            .as_str()
            .or_else(|| response["instance"]["status"].as_str())
            .unwrap_or_default();
        if state == "open" {
            self.mark_open();
        } else if let Some(qr) = extract_qr(response) {
            self.announce_qr(qr);
        }
    }

    /// Emits `qr` unless it repeats the code announced last.
    fn announce_qr(&self, qr: PairingQr) {
        let Ok(mut last) = self.last_qr.lock() else {
            return;
        };
        let key = |qr: &PairingQr| qr.code.clone().or_else(|| qr.image.clone());
        if last.as_ref().map(key) == Some(key(&qr)) {
            return;
        }
        *last = Some(qr.clone());
        drop(last);
        self.emit(ClientEvent::Qr(qr));
    }

    async fn refresh_pairing(&self) {
        match self.connect_instance().await {
            Ok(response) => self.announce(&response),
            Err(err) => warn!(%err, "refreshing pairing code failed"),
        }
    }

    fn mark_open(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(ClientEvent::Authenticated);
            self.emit(ClientEvent::Ready);
        }
    }

    async fn poll_connection(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match self.connection_state().await {
                Ok(state) if state == "open" || state == "connected" => self.mark_open(),
                Ok(state) if state == "close" => {
                    let reason = if self.connected.swap(false, Ordering::SeqCst) {
                        "gateway reports connection closed"
                    } else {
                        "gateway closed the session before pairing completed"
                    };
                    self.emit(ClientEvent::Disconnected {
                        reason: reason.into(),
                    });
                    break;
                }
                Ok(state) => {
                    debug!(%state, "gateway connection state");
                    if !self.connected.load(Ordering::SeqCst) {
                        self.refresh_pairing().await;
                    }
                }
                Err(err) => warn!(%err, "gateway connection state check failed"),
            }
        }
    }

    async fn backup_auth(self: Arc<Self>) {
        let mut ticker = interval(self.auth.backup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            if self.connected.load(Ordering::SeqCst) {
                self.persist_credentials("open").await;
                debug!("auth state backed up");
            }
        }
    }
}

impl EvolutionClient {
    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }
}

#[async_trait]
impl ChatClient for EvolutionClient {
    async fn initialize(&self) -> Result<(), ChatClientError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        self.hub.attach(inner.events.clone()).await;

        let response = match inner.stored_credentials().await {
            Some(credentials) => {
                info!(instance = %credentials.instance_name, "re-attaching to stored gateway session");
                *inner
                    .credentials
                    .lock()
                    .map_err(|_| ChatClientError::Protocol("credential lock poisoned".into()))? =
                    Some(credentials);
                inner.connect_instance().await?
            }
            None => {
                let token = Uuid::new_v4().simple().to_string();
                let response = match inner.create_instance(&token).await {
                    Ok(response) => response,
                    Err(ChatClientError::Gateway { status, body })
                        if is_instance_conflict(status, &body) =>
                    {
                        info!(instance = %inner.config.instance_name, "gateway instance exists; connecting");
                        inner.connect_instance().await?
                    }
                    Err(err) => return Err(err),
                };
                let token = response["hash"]["apikey"]
                    .as_str()
                    .or_else(|| response["hash"].as_str())
                    .unwrap_or(token.as_str())
                    .to_string();
                *inner
                    .credentials
                    .lock()
                    .map_err(|_| ChatClientError::Protocol("credential lock poisoned".into()))? =
                    Some(InstanceCredentials {
                        instance_name: inner.config.instance_name.clone(),
                        token,
                        state: None,
                        synced_at: None,
                    });
                response
            }
        };

        inner.persist_credentials("connecting").await;
        inner.announce(&response);

        self.track(tokio::spawn(Arc::clone(inner).poll_connection()));
        self.track(tokio::spawn(Arc::clone(inner).backup_auth()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), ChatClientError> {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);
        inner
            .call(
                inner
                    .http
                    .delete(inner.config.instance_endpoint("instance/logout")),
            )
            .await
            .map(|_| ())
    }

    async fn destroy(&self) -> Result<(), ChatClientError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.hub.detach(self.inner.events.generation()).await;
        Ok(())
    }

    async fn resolve_number(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<ChatId>, ChatClientError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let body = inner
            .call(
                inner
                    .http
                    .post(inner.config.instance_endpoint("chat/whatsappNumbers"))
                    .json(&json!({ "numbers": [phone.digits()] })),
            )
            .await?;
        let entries = body
            .as_array()
            .ok_or_else(|| ChatClientError::Protocol("number lookup is not a list".into()))?;
        let resolved = entries
            .iter()
            .filter(|entry| entry["exists"].as_bool().unwrap_or(false))
            .find_map(|entry| entry["jid"].as_str())
            .and_then(|jid| ChatId::new(jid).ok());
        Ok(resolved)
    }

    async fn send_text(&self, to: &ChatId, text: &str) -> Result<MessageReceipt, ChatClientError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let body = inner
            .call(
                inner
                    .http
                    .post(inner.config.instance_endpoint("message/sendText"))
                    .json(&json!({ "number": to.as_str(), "text": text })),
            )
            .await?;
        let id = body["key"]["id"]
            .as_str()
            .ok_or_else(|| ChatClientError::Protocol("send receipt has no message id".into()))?
            .to_string();
        Ok(MessageReceipt {
            id,
            to: to.clone(),
            timestamp: parse_message_timestamp(&body["messageTimestamp"]),
            raw: body,
        })
    }

    async fn reject_call(&self, call: &IncomingCall) -> Result<(), ChatClientError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        debug!(call_id = %call.id, "asserting gateway call rejection");
        let current = inner
            .call(
                inner
                    .http
                    .get(inner.config.instance_endpoint("settings/find")),
            )
            .await?;
        inner
            .call(
                inner
                    .http
                    .post(inner.config.instance_endpoint("settings/set"))
                    .json(&call_rejection_settings(&current)),
            )
            .await
            .map(|_| ())
    }
}

impl Drop for EvolutionClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
