use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wabridged::{run, ReconnectPolicy, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat gateway automation bridge daemon", long_about = None)]
struct Cli {
    #[arg(long, default_value = "0.0.0.0", help = "Interface the HTTP facade binds to")]
    host: String,

    #[arg(
        long,
        env = "PORT",
        default_value_t = 3000,
        help = "Port for the HTTP and realtime facade"
    )]
    port: u16,

    #[arg(
        long,
        env = "WABRIDGE_DATABASE_URL",
        hide_env_values = true,
        help = "Session store connection string (sqlite://path, sqlite::memory: or a file path)"
    )]
    database_url: String,

    #[arg(
        long,
        env = "WABRIDGE_SESSION_ID",
        default_value = "whatsapp",
        help = "Identifier of the persisted session record"
    )]
    session_id: String,

    #[arg(
        long,
        env = "EVOLUTION_API_URL",
        help = "Base URL of the chat gateway (e.g., http://localhost:8080)"
    )]
    gateway_url: String,

    #[arg(
        long,
        env = "EVOLUTION_API_KEY",
        hide_env_values = true,
        help = "API key sent to the chat gateway"
    )]
    gateway_api_key: String,

    #[arg(
        long,
        env = "EVOLUTION_INSTANCE",
        default_value = "wabridge",
        help = "Gateway instance name owned by this bridge"
    )]
    instance_name: String,

    #[arg(
        long,
        env = "WABRIDGE_WEBHOOK_URL",
        help = "Public URL of /webhook/evolution registered with the gateway"
    )]
    webhook_url: Option<String>,

    #[arg(
        long,
        env = "WABRIDGE_WEBHOOK_TOKEN",
        hide_env_values = true,
        help = "Token the gateway must present on webhook deliveries"
    )]
    webhook_token: Option<String>,

    #[arg(
        long,
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval in milliseconds between gateway connection-state polls"
    )]
    gateway_poll_interval_ms: u64,

    #[arg(
        long,
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval in seconds between auth state backups"
    )]
    auth_backup_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 5000,
        help = "Base delay in milliseconds before a rebootstrap"
    )]
    reconnect_delay_ms: u64,

    #[arg(
        long,
        default_value_t = 300_000,
        help = "Upper bound in milliseconds for the rebootstrap backoff"
    )]
    reconnect_max_delay_ms: u64,

    #[arg(
        long,
        default_value_t = 12,
        help = "Reconnect attempts before the session is marked failed (0 = unlimited)"
    )]
    reconnect_max_attempts: u32,

    #[arg(
        long,
        help = "OTLP endpoint for metrics export (e.g., http://localhost:4318)"
    )]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            host: self.host,
            port: self.port,
            database_url: self.database_url,
            session_id: self.session_id,
            gateway_url: self.gateway_url,
            gateway_api_key: self.gateway_api_key,
            instance_name: self.instance_name,
            webhook_url: self.webhook_url,
            webhook_token: self.webhook_token,
            gateway_poll_interval: Duration::from_millis(self.gateway_poll_interval_ms),
            auth_backup_interval: Duration::from_secs(self.auth_backup_interval_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.reconnect_max_attempts,
                ..ReconnectPolicy::default()
            },
            otlp_endpoint: self.otlp_endpoint,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()).await
}
