use crate::domain::session::SessionName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque gateway credentials backed up by the remote auth strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub session_id: SessionName,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl AuthState {
    pub fn new(session_id: SessionName, payload: Value) -> Self {
        Self {
            session_id,
            payload,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuthStateRepository: Send + Sync {
    async fn load(&self, session_id: &SessionName) -> anyhow::Result<Option<AuthState>>;
    async fn save(&self, state: AuthState) -> anyhow::Result<()>;
    async fn remove(&self, session_id: &SessionName) -> anyhow::Result<()>;
}
