use crate::domain::session::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("chat client is not ready")]
    NotReady,
    #[error("{0}")]
    MissingFields(String),
    #[error("{0}")]
    InvalidPhoneNumber(String),
    #[error("{0} is not registered on the chat network")]
    UnknownRecipient(String),
    #[error("message dispatch failed: {0}")]
    Dispatch(String),
}

/// Body of `POST /send-message`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status pushed to realtime observers. Carries the API key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub state: ConnectionState,
}

/// Frames sent over `/ws`: `{"qr": "<data url>"}` or `{"status": {...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverMessage {
    Qr(String),
    Status(StatusSnapshot),
}

/// Secret-free view served by `GET /status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: String,
    pub ready: bool,
    pub state: ConnectionState,
    pub generation: u64,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub pairing: bool,
    pub last_error: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observer_frames_are_externally_tagged() {
        let qr = ObserverMessage::Qr("data:image/svg+xml;base64,AA".into());
        assert_eq!(
            serde_json::to_value(&qr).unwrap(),
            json!({"qr": "data:image/svg+xml;base64,AA"})
        );

        let status = ObserverMessage::Status(StatusSnapshot {
            ready: true,
            api_key: Some("abc".into()),
            state: ConnectionState::Ready,
        });
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"status": {"ready": true, "apiKey": "abc", "state": "ready"}})
        );
    }

    #[test]
    fn send_request_tolerates_missing_fields() {
        let request: SendMessageRequest =
            serde_json::from_value(json!({"apiKey": "k", "phoneNumber": "+1555"})).unwrap();
        assert_eq!(request.api_key.as_deref(), Some("k"));
        assert!(request.message.is_none());
    }
}
