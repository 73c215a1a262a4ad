use super::events::{SessionDomainEvent, SessionEventEnvelope};
use super::value_object::PairingQr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Pairing,
    Authenticated,
    Ready,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Pairing => "pairing",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTrigger {
    QrIssued,
    Authenticated,
    Ready,
    Disconnected,
    LoggedOut,
    Rebootstrap,
    RetriesExhausted,
}

/// Transition table of the client session. `None` means the trigger is ignored in `from`.
pub fn next_state(from: ConnectionState, trigger: SessionTrigger) -> Option<ConnectionState> {
    use ConnectionState::*;
    use SessionTrigger as T;
    match (from, trigger) {
        (Uninitialized | Pairing, T::QrIssued) => Some(Pairing),
        (Uninitialized | Pairing, T::Authenticated) => Some(Authenticated),
        (Uninitialized | Pairing | Authenticated, T::Ready) => Some(Ready),
        (Uninitialized | Pairing | Authenticated | Ready, T::Disconnected) => Some(Disconnected),
        (_, T::LoggedOut) => Some(Disconnected),
        (Disconnected | Failed, T::Rebootstrap) => Some(Uninitialized),
        (Disconnected, T::RetriesExhausted) => Some(Failed),
        _ => None,
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("trigger {trigger:?} is not accepted in state {from:?}")]
    Rejected {
        from: ConnectionState,
        trigger: SessionTrigger,
    },
}

/// Aggregate capturing the lifecycle of the chat client connection.
///
/// Every client instance gets a generation number; events produced by an older
/// generation must be discarded by the owner before they reach this aggregate.
#[derive(Clone, Debug)]
pub struct ClientSession {
    state: ConnectionState,
    generation: u64,
    qr: Option<PairingQr>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    last_transition_at: DateTime<Utc>,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            generation: 0,
            qr: None,
            reconnect_attempts: 0,
            last_error: None,
            last_transition_at: Utc::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn qr(&self) -> Option<&PairingQr> {
        self.qr.as_ref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// Starts a new client generation for a (re)bootstrap.
    pub fn begin_generation(&mut self) -> (u64, Option<SessionEventEnvelope>) {
        self.generation += 1;
        let envelope = self.apply(SessionTrigger::Rebootstrap).ok().flatten();
        (self.generation, envelope)
    }

    /// Invalidates the current client instance without starting a new one.
    pub fn retire_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn issue_qr(&mut self, qr: PairingQr) -> Result<Vec<SessionEventEnvelope>, TransitionError> {
        let mut envelopes = Vec::with_capacity(2);
        if let Some(changed) = self.apply(SessionTrigger::QrIssued)? {
            envelopes.push(changed);
        }
        self.qr = Some(qr);
        envelopes.push(SessionEventEnvelope::new(
            self.generation,
            SessionDomainEvent::QrIssued,
        ));
        Ok(envelopes)
    }

    pub fn mark_authenticated(&mut self) -> Result<Option<SessionEventEnvelope>, TransitionError> {
        self.apply(SessionTrigger::Authenticated)
    }

    pub fn mark_ready(&mut self) -> Result<Option<SessionEventEnvelope>, TransitionError> {
        let envelope = self.apply(SessionTrigger::Ready)?;
        self.qr = None;
        self.reconnect_attempts = 0;
        self.last_error = None;
        Ok(envelope)
    }

    pub fn mark_disconnected(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<Option<SessionEventEnvelope>, TransitionError> {
        let envelope = self.apply(SessionTrigger::Disconnected)?;
        self.qr = None;
        self.last_error = Some(reason.into());
        Ok(envelope)
    }

    pub fn log_out(&mut self) -> Option<SessionEventEnvelope> {
        let envelope = self.apply(SessionTrigger::LoggedOut).ok().flatten();
        self.qr = None;
        self.reconnect_attempts = 0;
        self.last_error = Some("logged out".to_string());
        envelope
    }

    pub fn record_reconnect_attempt(&mut self) -> SessionEventEnvelope {
        self.reconnect_attempts += 1;
        SessionEventEnvelope::new(
            self.generation,
            SessionDomainEvent::ReconnectAttemptRecorded {
                attempt: self.reconnect_attempts,
            },
        )
    }

    pub fn give_up(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<Option<SessionEventEnvelope>, TransitionError> {
        let envelope = self.apply(SessionTrigger::RetriesExhausted)?;
        self.last_error = Some(reason.into());
        Ok(envelope)
    }

    fn apply(
        &mut self,
        trigger: SessionTrigger,
    ) -> Result<Option<SessionEventEnvelope>, TransitionError> {
        let from = self.state;
        let to = next_state(from, trigger).ok_or(TransitionError::Rejected { from, trigger })?;
        if to == from {
            return Ok(None);
        }
        self.state = to;
        self.last_transition_at = Utc::now();
        Ok(Some(SessionEventEnvelope::new(
            self.generation,
            SessionDomainEvent::StateChanged { from, to, trigger },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qr() -> PairingQr {
        PairingQr::new(Some("2@pairing".into()), None).unwrap()
    }

    #[test]
    fn pairing_flow_reaches_ready() {
        let mut session = ClientSession::new();
        let (generation, envelope) = session.begin_generation();
        assert_eq!(generation, 1);
        assert!(envelope.is_none(), "first bootstrap stays uninitialized");

        let envelopes = session.issue_qr(qr()).unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(session.state(), ConnectionState::Pairing);
        assert!(session.qr().is_some());

        session.mark_authenticated().unwrap();
        assert_eq!(session.state(), ConnectionState::Authenticated);
        assert!(!session.is_ready());

        let ready = session.mark_ready().unwrap().unwrap();
        assert_eq!(ready.entered_state(), Some(ConnectionState::Ready));
        assert!(session.is_ready());
        assert!(session.qr().is_none());
    }

    #[test]
    fn qr_refresh_while_pairing_only_replaces_payload() {
        let mut session = ClientSession::new();
        session.issue_qr(qr()).unwrap();
        let refreshed = PairingQr::new(Some("2@next".into()), None).unwrap();
        let envelopes = session.issue_qr(refreshed.clone()).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event, SessionDomainEvent::QrIssued);
        assert_eq!(session.qr(), Some(&refreshed));
    }

    #[test]
    fn qr_after_ready_is_rejected() {
        let mut session = ClientSession::new();
        session.mark_ready().unwrap();
        let err = session.issue_qr(qr()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Rejected {
                from: ConnectionState::Ready,
                trigger: SessionTrigger::QrIssued,
            }
        );
        assert!(session.qr().is_none());
    }

    #[test]
    fn duplicate_disconnect_is_rejected() {
        let mut session = ClientSession::new();
        session.mark_ready().unwrap();
        assert!(session.mark_disconnected("socket closed").unwrap().is_some());
        assert!(!session.is_ready());
        assert_eq!(session.last_error(), Some("socket closed"));
        assert!(session.mark_disconnected("again").is_err());
    }

    #[test]
    fn rebootstrap_leaves_disconnected_state() {
        let mut session = ClientSession::new();
        session.mark_disconnected("boot failure").unwrap();
        let (generation, envelope) = session.begin_generation();
        assert_eq!(generation, 1);
        assert_eq!(
            envelope.and_then(|e| e.entered_state()),
            Some(ConnectionState::Uninitialized)
        );
    }

    #[test]
    fn ready_resets_reconnect_attempts() {
        let mut session = ClientSession::new();
        session.mark_disconnected("drop").unwrap();
        session.record_reconnect_attempt();
        let envelope = session.record_reconnect_attempt();
        assert_eq!(
            envelope.event,
            SessionDomainEvent::ReconnectAttemptRecorded { attempt: 2 }
        );
        session.begin_generation();
        session.mark_ready().unwrap();
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn give_up_only_from_disconnected() {
        let mut session = ClientSession::new();
        assert!(session.give_up("exhausted").is_err());
        session.mark_disconnected("drop").unwrap();
        session.give_up("exhausted").unwrap();
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(session.mark_disconnected("late").is_err());
    }

    #[test]
    fn logout_is_accepted_from_every_state() {
        for state in [
            ConnectionState::Uninitialized,
            ConnectionState::Pairing,
            ConnectionState::Authenticated,
            ConnectionState::Ready,
            ConnectionState::Disconnected,
            ConnectionState::Failed,
        ] {
            assert_eq!(
                next_state(state, SessionTrigger::LoggedOut),
                Some(ConnectionState::Disconnected)
            );
        }
        let mut session = ClientSession::new();
        session.mark_ready().unwrap();
        session.record_reconnect_attempt();
        assert!(session.log_out().is_some());
        assert_eq!(session.reconnect_attempts(), 0);
        assert!(!session.is_ready());
    }

    #[test]
    fn retire_generation_is_monotonic() {
        let mut session = ClientSession::new();
        let (first, _) = session.begin_generation();
        let retired = session.retire_generation();
        let (next, _) = session.begin_generation();
        assert!(first < retired && retired < next);
    }
}
