use crate::domain::session::{ChatId, PairingQr, PhoneNumber, SessionName};
use crate::ports::session::AuthStateRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub id: String,
    pub from: String,
    pub is_video: bool,
}

/// Lifecycle events a chat client reports to its owner.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Qr(PairingQr),
    Authenticated,
    Ready,
    Call(IncomingCall),
    Disconnected { reason: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Qr(_) => "qr",
            ClientEvent::Authenticated => "authenticated",
            ClientEvent::Ready => "ready",
            ClientEvent::Call(_) => "call",
            ClientEvent::Disconnected { .. } => "disconnected",
        }
    }
}

/// Channel end handed to a client instance; every event is tagged with the
/// generation the instance was created for.
#[derive(Clone, Debug)]
pub struct ClientEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, ClientEvent)>,
}

impl ClientEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, ClientEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving side is gone.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Remote-backed auth strategy: gateway credentials live in the auth state store.
#[derive(Clone)]
pub struct RemoteAuth {
    pub session_id: SessionName,
    pub store: Arc<dyn AuthStateRepository>,
    pub backup_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub id: String,
    pub to: ChatId,
    pub timestamp: DateTime<Utc>,
    /// Provider response as returned by the gateway.
    pub raw: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatClientError {
    #[error("gateway unreachable: {0}")]
    Transport(String),
    #[error("gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },
    #[error("unexpected gateway payload: {0}")]
    Protocol(String),
    #[error("client instance already torn down")]
    Closed,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Starts the connection. Completion is reported through `qr`/`ready` events.
    async fn initialize(&self) -> Result<(), ChatClientError>;

    async fn logout(&self) -> Result<(), ChatClientError>;

    /// Releases local resources (background tasks). Safe to call more than once.
    async fn destroy(&self) -> Result<(), ChatClientError>;

    async fn resolve_number(&self, phone: &PhoneNumber)
        -> Result<Option<ChatId>, ChatClientError>;

    async fn send_text(&self, to: &ChatId, text: &str) -> Result<MessageReceipt, ChatClientError>;

    async fn reject_call(&self, call: &IncomingCall) -> Result<(), ChatClientError>;
}

pub trait ChatClientFactory: Send + Sync {
    fn create(
        &self,
        auth: RemoteAuth,
        events: ClientEventSink,
    ) -> Result<Arc<dyn ChatClient>, ChatClientError>;
}
