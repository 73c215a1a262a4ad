pub mod aggregate;
pub mod events;
pub mod record;
pub mod value_object;

pub use aggregate::{ClientSession, ConnectionState, TransitionError};
pub use events::{SessionDomainEvent, SessionEventEnvelope};
pub use record::SessionRecord;
pub use value_object::{ApiKey, ChatId, PairingQr, PhoneNumber, SessionName};
