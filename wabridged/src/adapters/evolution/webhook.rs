use crate::domain::session::PairingQr;
use crate::ports::chat::{ClientEvent, ClientEventSink, IncomingCall};
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::debug;

/// Result of routing one webhook delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    Delivered(usize),
    Ignored(&'static str),
}

/// Routes gateway webhook deliveries to the client instance currently attached.
pub struct EvolutionWebhookHub {
    instance_name: String,
    token: Option<String>,
    sink: RwLock<Option<ClientEventSink>>,
}

impl EvolutionWebhookHub {
    pub fn new(instance_name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            token: token.filter(|t| !t.is_empty()),
            sink: RwLock::new(None),
        }
    }

    pub async fn attach(&self, sink: ClientEventSink) {
        *self.sink.write().await = Some(sink);
    }

    /// Detaches the sink only if it still belongs to `generation`.
    pub async fn detach(&self, generation: u64) {
        let mut guard = self.sink.write().await;
        if guard.as_ref().map(ClientEventSink::generation) == Some(generation) {
            *guard = None;
        }
    }

    pub fn verify_token(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(candidate)) => {
                expected.len() == candidate.len()
                    && bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
            }
            (Some(_), None) => false,
        }
    }

    pub async fn dispatch(&self, payload: &Value) -> WebhookOutcome {
        let events = parse_webhook_event(payload, &self.instance_name);
        if events.is_empty() {
            return WebhookOutcome::Ignored("no lifecycle event");
        }
        let guard = self.sink.read().await;
        let Some(sink) = guard.as_ref() else {
            return WebhookOutcome::Ignored("no client attached");
        };
        let mut delivered = 0;
        for event in events {
            debug!(generation = sink.generation(), event = event.name(), "webhook event");
            if sink.emit(event) {
                delivered += 1;
            }
        }
        WebhookOutcome::Delivered(delivered)
    }
}

fn normalize_event_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', ".")
}

/// Pulls the pairing payload out of the shapes the gateway uses for create,
/// connect and `qrcode.updated` responses.
pub fn extract_qr(value: &Value) -> Option<PairingQr> {
    let nested = &value["qrcode"];
    let code = nested["code"]
        .as_str()
        .or_else(|| value["code"].as_str())
        .map(str::to_string);
    let image = nested["base64"]
        .as_str()
        .or_else(|| value["base64"].as_str())
        .or_else(|| nested.as_str().filter(|s| s.starts_with("data:")))
        .map(str::to_string);
    PairingQr::new(code, image)
}

fn parse_call(value: &Value) -> Option<IncomingCall> {
    let status = value["status"].as_str().unwrap_or("offer");
    if status != "offer" {
        return None;
    }
    let id = value["id"].as_str()?.to_string();
    let from = value["from"].as_str().unwrap_or_default().to_string();
    Some(IncomingCall {
        id,
        from,
        is_video: value["isVideo"].as_bool().unwrap_or(false),
    })
}

/// Maps one webhook body to client events. Deliveries for other instances yield nothing.
pub fn parse_webhook_event(payload: &Value, instance_name: &str) -> Vec<ClientEvent> {
    let instance = payload["instance"]
        .as_str()
        .or_else(|| payload["data"]["instance"].as_str());
    if let Some(instance) = instance {
        if instance != instance_name {
            return Vec::new();
        }
    }
    let event = normalize_event_name(payload["event"].as_str().unwrap_or_default());
    let data = &payload["data"];
    match event.as_str() {
        "qrcode.updated" => extract_qr(data)
            .map(|qr| vec![ClientEvent::Qr(qr)])
            .unwrap_or_default(),
        "connection.update" => match data["state"].as_str().unwrap_or_default() {
            "open" | "connected" => vec![ClientEvent::Authenticated, ClientEvent::Ready],
            "close" => {
                let reason = match &data["statusReason"] {
                    Value::Null => "connection closed".to_string(),
                    code => format!("connection closed (status {code})"),
                };
                vec![ClientEvent::Disconnected { reason }]
            }
            _ => Vec::new(),
        },
        "call" => match data {
            Value::Array(calls) => calls
                .iter()
                .filter_map(parse_call)
                .map(ClientEvent::Call)
                .collect(),
            other => parse_call(other)
                .map(|call| vec![ClientEvent::Call(call)])
                .unwrap_or_default(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn open_connection_maps_to_authenticated_and_ready() {
        let payload = json!({
            "event": "CONNECTION_UPDATE",
            "instance": "wabridge",
            "data": {"instance": "wabridge", "state": "open", "statusReason": 200}
        });
        assert_eq!(
            parse_webhook_event(&payload, "wabridge"),
            vec![ClientEvent::Authenticated, ClientEvent::Ready]
        );
    }

    #[test]
    fn close_carries_status_reason() {
        let payload = json!({
            "event": "connection.update",
            "instance": "wabridge",
            "data": {"state": "close", "statusReason": 428}
        });
        let events = parse_webhook_event(&payload, "wabridge");
        assert_eq!(
            events,
            vec![ClientEvent::Disconnected {
                reason: "connection closed (status 428)".into()
            }]
        );
    }

    #[test]
    fn qr_update_prefers_raw_code_and_keeps_image() {
        let payload = json!({
            "event": "qrcode.updated",
            "instance": "wabridge",
            "data": {"qrcode": {"code": "2@abc", "base64": "data:image/png;base64,AAAA"}}
        });
        let events = parse_webhook_event(&payload, "wabridge");
        let ClientEvent::Qr(qr) = &events[0] else {
            panic!("expected qr event, got {events:?}");
        };
        assert_eq!(qr.code.as_deref(), Some("2@abc"));
        assert_eq!(qr.image.as_deref(), Some("data:image/png;base64,AAAA"));
    }

    #[test]
    fn call_offers_become_call_events() {
        let payload = json!({
            "event": "call",
            "instance": "wabridge",
            "data": [
                {"id": "C1", "from": "1555@s.whatsapp.net", "status": "offer", "isVideo": true},
                {"id": "C1", "from": "1555@s.whatsapp.net", "status": "terminate"}
            ]
        });
        let events = parse_webhook_event(&payload, "wabridge");
        assert_eq!(
            events,
            vec![ClientEvent::Call(IncomingCall {
                id: "C1".into(),
                from: "1555@s.whatsapp.net".into(),
                is_video: true,
            })]
        );
    }

    #[test]
    fn foreign_instances_and_unknown_events_are_ignored() {
        let foreign = json!({"event": "connection.update", "instance": "other", "data": {"state": "open"}});
        assert!(parse_webhook_event(&foreign, "wabridge").is_empty());
        let inbound = json!({"event": "messages.upsert", "instance": "wabridge", "data": {}});
        assert!(parse_webhook_event(&inbound, "wabridge").is_empty());
    }

    #[tokio::test]
    async fn hub_routes_to_attached_generation_only() {
        let hub = EvolutionWebhookHub::new("wabridge", None);
        let open = json!({"event": "connection.update", "instance": "wabridge", "data": {"state": "open"}});
        assert_eq!(
            hub.dispatch(&open).await,
            WebhookOutcome::Ignored("no client attached")
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach(ClientEventSink::new(4, tx.clone())).await;
        assert_eq!(hub.dispatch(&open).await, WebhookOutcome::Delivered(2));
        assert_eq!(rx.recv().await.unwrap(), (4, ClientEvent::Authenticated));

        hub.attach(ClientEventSink::new(5, tx)).await;
        hub.detach(4).await;
        assert_eq!(hub.dispatch(&open).await, WebhookOutcome::Delivered(2));
        hub.detach(5).await;
        assert_eq!(
            hub.dispatch(&open).await,
            WebhookOutcome::Ignored("no client attached")
        );
    }

    #[test]
    fn token_verification() {
        let open = EvolutionWebhookHub::new("wabridge", None);
        assert!(open.verify_token(None));

        let guarded = EvolutionWebhookHub::new("wabridge", Some("hook-secret".into()));
        assert!(guarded.verify_token(Some("hook-secret")));
        assert!(!guarded.verify_token(Some("hook-secreT")));
        assert!(!guarded.verify_token(None));
    }
}
