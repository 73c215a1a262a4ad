use super::aggregate::{ConnectionState, SessionTrigger};
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, PartialEq)]
pub enum SessionDomainEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        trigger: SessionTrigger,
    },
    QrIssued,
    ReconnectAttemptRecorded {
        attempt: u32,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionEventEnvelope {
    pub generation: u64,
    pub occurred_at: DateTime<Utc>,
    pub event: SessionDomainEvent,
}

impl SessionEventEnvelope {
    pub fn new(generation: u64, event: SessionDomainEvent) -> Self {
        Self {
            generation,
            occurred_at: Utc::now(),
            event,
        }
    }

    /// Target state when this envelope records a transition.
    pub fn entered_state(&self) -> Option<ConnectionState> {
        match self.event {
            SessionDomainEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_records_timestamp_and_state() {
        let envelope = SessionEventEnvelope::new(
            3,
            SessionDomainEvent::StateChanged {
                from: ConnectionState::Pairing,
                to: ConnectionState::Ready,
                trigger: SessionTrigger::Ready,
            },
        );
        assert_eq!(envelope.generation, 3);
        assert!(envelope.occurred_at <= Utc::now());
        assert_eq!(envelope.entered_state(), Some(ConnectionState::Ready));
        let qr = SessionEventEnvelope::new(3, SessionDomainEvent::QrIssued);
        assert_eq!(qr.entered_state(), None);
    }
}
