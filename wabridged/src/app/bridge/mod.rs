pub mod bootstrap;
pub mod model;
pub mod qr;
pub mod reconnect;
pub mod service;

pub use model::{BridgeError, ObserverMessage, SendMessageRequest, StatusReport, StatusSnapshot};
pub use reconnect::ReconnectPolicy;
pub use service::{BridgeConfig, BridgeService, BridgeStores};
