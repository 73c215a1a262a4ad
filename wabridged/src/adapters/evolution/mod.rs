pub mod api;
pub mod config;
pub mod webhook;

pub use api::EvolutionClientFactory;
pub use config::EvolutionConfig;
pub use webhook::{EvolutionWebhookHub, WebhookOutcome};
