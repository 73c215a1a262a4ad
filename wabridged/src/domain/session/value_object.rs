use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use subtle::ConstantTimeEq;

const API_KEY_BYTES: usize = 16;
const PHONE_MIN_DIGITS: usize = 6;
const PHONE_MAX_DIGITS: usize = 15;

/// Fixed identifier under which the session record and auth state are stored.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionName(String);

impl SessionName {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err("session id cannot be empty".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SessionName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        SessionName::new(value).map_err(D::Error::custom)
    }
}

/// Shared secret authorizing facade callers. Hex encoded, compared in constant time.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn generate() -> Result<Self, String> {
        let mut bytes = [0u8; API_KEY_BYTES];
        getrandom::fill(&mut bytes).map_err(|err| format!("random source unavailable: {err}"))?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err("api key cannot be empty".to_string());
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }
        expected.ct_eq(candidate).into()
    }

    /// Prefix safe to put in logs.
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.redacted()).finish()
    }
}

impl Serialize for ApiKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        ApiKey::parse(value).map_err(D::Error::custom)
    }
}

/// Phone number reduced to its digits (country code included, no leading `+`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut digits = String::with_capacity(raw.len());
        for (idx, ch) in raw.trim().chars().enumerate() {
            match ch {
                '0'..='9' => digits.push(ch),
                '+' if idx == 0 => {}
                ' ' | '-' | '.' | '(' | ')' => {}
                other => return Err(format!("unexpected character '{other}' in phone number")),
            }
        }
        if digits.len() < PHONE_MIN_DIGITS || digits.len() > PHONE_MAX_DIGITS {
            return Err(format!(
                "phone number must have between {PHONE_MIN_DIGITS} and {PHONE_MAX_DIGITS} digits"
            ));
        }
        Ok(Self(digits))
    }

    pub fn digits(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// Platform identifier a phone number resolves to (e.g. `15551234567@s.whatsapp.net`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err("chat id cannot be empty".to_string());
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pairing payload emitted while the client waits for a QR scan.
///
/// `code` is the raw string to encode; `image` is a ready-made rendering when the
/// gateway supplies one (usually a `data:image/png;base64,...` URL).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingQr {
    pub code: Option<String>,
    pub image: Option<String>,
}

impl PairingQr {
    pub fn new(code: Option<String>, image: Option<String>) -> Option<Self> {
        let code = code.filter(|c| !c.trim().is_empty());
        let image = image.filter(|i| !i.trim().is_empty());
        if code.is_none() && image.is_none() {
            return None;
        }
        Some(Self { code, image })
    }
}
