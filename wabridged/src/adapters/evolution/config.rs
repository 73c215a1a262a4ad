use std::fmt;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for an Evolution API gateway.
#[derive(Clone)]
pub struct EvolutionConfig {
    pub base_url: String,
    pub api_key: String,
    pub instance_name: String,
    /// Public URL of this bridge's webhook intake, registered on instance creation.
    pub webhook_url: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl EvolutionConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        instance_name: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            instance_name: instance_name.into(),
            webhook_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_webhook_url(mut self, url: Option<String>) -> Self {
        self.webhook_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn instance_endpoint(&self, action: &str) -> String {
        self.endpoint(&format!("{action}/{}", self.instance_name))
    }
}

impl fmt::Debug for EvolutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("instance_name", &self.instance_name)
            .field("webhook_url", &self.webhook_url)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
