use super::value_object::{ApiKey, SessionName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted pairing of the fixed session id with the facade API key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionName,
    pub api_key: ApiKey,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: SessionName, api_key: ApiKey) -> Self {
        Self {
            session_id,
            api_key,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_in_camel_case() {
        let record = SessionRecord::new(
            SessionName::new("whatsapp").unwrap(),
            ApiKey::parse("00ff00ff00ff00ff00ff00ff00ff00ff").unwrap(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sessionId"], "whatsapp");
        assert_eq!(json["apiKey"], "00ff00ff00ff00ff00ff00ff00ff00ff");
        assert!(json["createdAt"].is_string());
    }
}
