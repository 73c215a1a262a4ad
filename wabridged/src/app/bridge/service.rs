use super::bootstrap::ensure_session_record;
use super::model::{BridgeError, ObserverMessage, SendMessageRequest, StatusReport, StatusSnapshot};
use super::qr::render_data_url;
use super::reconnect::{ReconnectPolicy, ReconnectScheduler};
use crate::domain::session::{
    ApiKey, ClientSession, ConnectionState, PhoneNumber, SessionDomainEvent, SessionEventEnvelope,
    SessionName, TransitionError,
};
use crate::ports::chat::{
    ChatClient, ChatClientFactory, ClientEvent, ClientEventSink, IncomingCall, MessageReceipt,
    RemoteAuth,
};
use crate::ports::session::{AuthStateRepository, SessionKeyRepository};
use crate::telemetry::BridgeMetrics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

const OBSERVER_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BridgeStores {
    pub keys: Arc<dyn SessionKeyRepository>,
    pub auth: Arc<dyn AuthStateRepository>,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub session_id: SessionName,
    pub reconnect: ReconnectPolicy,
    pub auth_backup_interval: Duration,
}

enum BridgeCommand {
    Bootstrap,
    Rebootstrap { ticket: u64 },
    Logout { done: oneshot::Sender<()> },
    Shutdown,
}

/// Owns the client session state machine and the single chat client instance.
///
/// Client events, rebootstrap and logout commands are consumed by one event-loop
/// task, so a logout never interleaves with a bootstrap in flight.
pub struct BridgeService {
    config: BridgeConfig,
    stores: BridgeStores,
    factory: Arc<dyn ChatClientFactory>,
    metrics: Option<Arc<BridgeMetrics>>,
    session: RwLock<ClientSession>,
    api_key: RwLock<Option<ApiKey>>,
    client: RwLock<Option<Arc<dyn ChatClient>>>,
    observers: broadcast::Sender<ObserverMessage>,
    events_tx: mpsc::UnboundedSender<(u64, ClientEvent)>,
    commands_tx: mpsc::UnboundedSender<BridgeCommand>,
    scheduler: ReconnectScheduler,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeService {
    /// Spawns the event loop and queues the initial bootstrap.
    pub fn start(
        config: BridgeConfig,
        stores: BridgeStores,
        factory: Arc<dyn ChatClientFactory>,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let service = Arc::new(Self {
            config,
            stores,
            factory,
            metrics,
            session: RwLock::new(ClientSession::new()),
            api_key: RwLock::new(None),
            client: RwLock::new(None),
            observers,
            events_tx,
            commands_tx,
            scheduler: ReconnectScheduler::new(),
            event_loop: Mutex::new(None),
        });
        let handle = tokio::spawn(Arc::clone(&service).run_event_loop(events_rx, commands_rx));
        if let Ok(mut slot) = service.event_loop.lock() {
            *slot = Some(handle);
        }
        let _ = service.commands_tx.send(BridgeCommand::Bootstrap);
        service
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<(u64, ClientEvent)>,
        mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => match command {
                    BridgeCommand::Bootstrap => self.bootstrap().await,
                    BridgeCommand::Rebootstrap { ticket } => {
                        if self.scheduler.claim(ticket) {
                            self.bootstrap().await;
                        } else {
                            debug!(ticket, "superseded rebootstrap ignored");
                        }
                    }
                    BridgeCommand::Logout { done } => {
                        self.perform_logout().await;
                        let _ = done.send(());
                    }
                    BridgeCommand::Shutdown => {
                        info!("bridge event loop stopping");
                        break;
                    }
                },
                Some((generation, event)) = events.recv() => {
                    self.handle_event(generation, event).await;
                }
                else => break,
            }
        }
    }

    async fn bootstrap(&self) {
        let generation = {
            let mut session = self.session.write().await;
            let (generation, envelope) = session.begin_generation();
            if let Some(envelope) = envelope {
                self.record(&envelope);
            }
            generation
        };
        info!(generation, session = %self.config.session_id, "bootstrapping chat client");

        let api_key = match ensure_session_record(self.stores.keys.as_ref(), &self.config.session_id)
            .await
        {
            Ok(key) => key,
            Err(err) => {
                self.fail_bootstrap(generation, "session_record", format!("{err:#}"));
                return;
            }
        };
        *self.api_key.write().await = Some(api_key);
        self.broadcast_status().await;

        let previous = self.client.write().await.take();
        if let Some(previous) = previous {
            if let Err(err) = previous.destroy().await {
                warn!(%err, "tearing down previous client failed");
            }
        }

        let auth = RemoteAuth {
            session_id: self.config.session_id.clone(),
            store: Arc::clone(&self.stores.auth),
            backup_interval: self.config.auth_backup_interval,
        };
        let sink = ClientEventSink::new(generation, self.events_tx.clone());
        let client = match self.factory.create(auth, sink) {
            Ok(client) => client,
            Err(err) => {
                self.fail_bootstrap(generation, "create", err.to_string());
                return;
            }
        };
        *self.client.write().await = Some(Arc::clone(&client));

        if let Err(err) = client.initialize().await {
            self.fail_bootstrap(generation, "initialize", err.to_string());
        }
    }

    fn fail_bootstrap(&self, generation: u64, stage: &'static str, reason: String) {
        error!(generation, stage, %reason, "session bootstrap failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_bootstrap_failure(stage);
        }
        let _ = self.events_tx.send((
            generation,
            ClientEvent::Disconnected {
                reason: format!("bootstrap failed ({stage}): {reason}"),
            },
        ));
    }

    async fn handle_event(&self, generation: u64, event: ClientEvent) {
        let name = event.name();
        match event {
            ClientEvent::Qr(qr) => {
                let rendered = render_data_url(&qr);
                {
                    let mut session = self.session.write().await;
                    if !Self::is_current(&session, generation, name) {
                        return;
                    }
                    match session.issue_qr(qr) {
                        Ok(envelopes) => envelopes.iter().for_each(|e| self.record(e)),
                        Err(err) => {
                            debug!(%err, "qr ignored");
                            return;
                        }
                    }
                }
                match rendered {
                    Ok(url) => {
                        info!(generation, "pairing QR issued; waiting for scan");
                        self.broadcast(ObserverMessage::Qr(url));
                    }
                    Err(err) => warn!(%err, "rendering pairing QR failed"),
                }
            }
            ClientEvent::Authenticated => {
                if self
                    .transition(generation, name, |session| session.mark_authenticated())
                    .await
                {
                    info!(generation, "chat client authenticated");
                    self.broadcast_status().await;
                }
            }
            ClientEvent::Ready => {
                if self
                    .transition(generation, name, |session| session.mark_ready())
                    .await
                {
                    info!(generation, "chat client ready");
                    self.broadcast_status().await;
                }
            }
            ClientEvent::Call(call) => {
                if self.session.read().await.generation() != generation {
                    debug!(generation, "call from stale client ignored");
                    return;
                }
                self.reject_call(call).await;
            }
            ClientEvent::Disconnected { reason } => self.handle_disconnect(generation, reason).await,
        }
    }

    fn is_current(session: &ClientSession, generation: u64, event: &'static str) -> bool {
        if session.generation() != generation {
            debug!(
                generation,
                current = session.generation(),
                event,
                "event from stale client dropped"
            );
            return false;
        }
        true
    }

    /// Applies a transition for a current-generation event; false when it was dropped.
    async fn transition<F>(&self, generation: u64, event: &'static str, apply: F) -> bool
    where
        F: FnOnce(
            &mut ClientSession,
        ) -> Result<Option<SessionEventEnvelope>, TransitionError>,
    {
        let mut session = self.session.write().await;
        if !Self::is_current(&session, generation, event) {
            return false;
        }
        match apply(&mut session) {
            Ok(envelope) => {
                if let Some(envelope) = envelope {
                    self.record(&envelope);
                }
                true
            }
            Err(err) => {
                debug!(%err, event, "event rejected by session state");
                false
            }
        }
    }

    async fn reject_call(&self, call: IncomingCall) {
        let Some(client) = self.client.read().await.clone() else {
            warn!(call_id = %call.id, "incoming call with no client attached");
            return;
        };
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match client.reject_call(&call).await {
                Ok(()) => {
                    info!(call_id = %call.id, from = %call.from, video = call.is_video, "incoming call rejected");
                    if let Some(metrics) = metrics {
                        metrics.record_call_rejected("rejected");
                    }
                }
                Err(err) => {
                    warn!(call_id = %call.id, %err, "rejecting incoming call failed");
                    if let Some(metrics) = metrics {
                        metrics.record_call_rejected("failed");
                    }
                }
            }
        });
    }

    async fn handle_disconnect(&self, generation: u64, reason: String) {
        let attempt = {
            let mut session = self.session.write().await;
            if !Self::is_current(&session, generation, "disconnected") {
                return;
            }
            match session.mark_disconnected(reason.clone()) {
                Ok(envelope) => {
                    if let Some(envelope) = envelope {
                        self.record(&envelope);
                    }
                }
                Err(err) => {
                    debug!(%err, "duplicate disconnect ignored");
                    return;
                }
            }
            session.retire_generation();
            let envelope = session.record_reconnect_attempt();
            self.record(&envelope);
            session.reconnect_attempts()
        };
        warn!(generation, %reason, "chat client disconnected");

        let retired = self.client.write().await.take();
        if let Some(client) = retired {
            if let Err(err) = client.destroy().await {
                warn!(%err, "tearing down disconnected client failed");
            }
        }
        self.broadcast_status().await;
        self.schedule_reconnect(attempt).await;
    }

    async fn schedule_reconnect(&self, attempt: u32) {
        match self.config.reconnect.delay_for(attempt) {
            Some(delay) => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rebootstrap scheduled"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_reconnect_scheduled(attempt);
                }
                self.schedule_rebootstrap(delay);
            }
            None => {
                {
                    let mut session = self.session.write().await;
                    match session.give_up(format!("gave up after {} reconnect attempts", attempt - 1)) {
                        Ok(Some(envelope)) => self.record(&envelope),
                        Ok(None) => {}
                        Err(err) => debug!(%err, "give up rejected"),
                    }
                }
                error!(
                    attempts = attempt - 1,
                    "reconnect attempts exhausted; session marked failed"
                );
                self.broadcast_status().await;
            }
        }
    }

    fn schedule_rebootstrap(&self, delay: Duration) {
        let commands = self.commands_tx.clone();
        self.scheduler.schedule(delay, move |ticket| {
            let _ = commands.send(BridgeCommand::Rebootstrap { ticket });
        });
    }

    /// Tears the session down and schedules a fresh pairing.
    ///
    /// Waits for any bootstrap in progress to settle first.
    pub async fn logout(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands_tx.send(BridgeCommand::Logout { done }).is_err() {
            warn!("bridge event loop stopped; logout skipped");
            return;
        }
        let _ = finished.await;
    }

    async fn perform_logout(&self) {
        let client = {
            let mut session = self.session.write().await;
            session.retire_generation();
            if let Some(envelope) = session.log_out() {
                self.record(&envelope);
            }
            self.client.write().await.take()
        };
        self.scheduler.cancel();
        info!("logout requested; client retired");
        self.broadcast_status().await;

        if let Some(client) = client {
            if let Err(err) = client.logout().await {
                warn!(%err, "gateway logout failed");
            }
            if let Err(err) = client.destroy().await {
                warn!(%err, "tearing down client after logout failed");
            }
        }
        if let Err(err) = self.stores.auth.remove(&self.config.session_id).await {
            warn!(%err, "removing stored auth state failed");
        }

        let delay = self.config.reconnect.base_delay;
        info!(delay_ms = delay.as_millis() as u64, "rebootstrap after logout scheduled");
        self.schedule_rebootstrap(delay);
    }

    /// Fails with `InvalidApiKey` unless `presented` matches the session key.
    pub async fn authorize(&self, presented: &str) -> Result<(), BridgeError> {
        match self.api_key.read().await.as_ref() {
            Some(key) if key.matches(presented) => Ok(()),
            _ => Err(BridgeError::InvalidApiKey),
        }
    }

    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MessageReceipt, BridgeError> {
        self.authorize(request.api_key.as_deref().unwrap_or_default())
            .await?;
        if !self.session.read().await.is_ready() {
            return Err(BridgeError::NotReady);
        }

        let phone = request
            .phone_number
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let message = request.message.as_deref().filter(|m| !m.trim().is_empty());
        let (Some(phone), Some(message)) = (phone, message) else {
            return Err(BridgeError::MissingFields(
                "phoneNumber and message are required".into(),
            ));
        };
        let phone = PhoneNumber::parse(phone).map_err(BridgeError::InvalidPhoneNumber)?;
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or(BridgeError::NotReady)?;

        let started = Instant::now();
        let chat = match client.resolve_number(&phone).await {
            Ok(Some(chat)) => chat,
            Ok(None) => {
                self.record_message("unknown_recipient", None);
                return Err(BridgeError::UnknownRecipient(phone.to_string()));
            }
            Err(err) => {
                warn!(%err, "number lookup failed");
                self.record_message("failed", None);
                return Err(BridgeError::Dispatch(err.to_string()));
            }
        };
        match client.send_text(&chat, message).await {
            Ok(receipt) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                self.record_message("sent", Some(elapsed));
                info!(message_id = %receipt.id, to = %chat, "message sent");
                Ok(receipt)
            }
            Err(err) => {
                warn!(%err, to = %chat, "message dispatch failed");
                self.record_message("failed", None);
                Err(BridgeError::Dispatch(err.to_string()))
            }
        }
    }

    fn record_message(&self, outcome: &'static str, duration_ms: Option<f64>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_message(outcome, duration_ms);
        }
    }

    /// Frames a new observer receives first, plus a receiver for everything after.
    pub async fn subscribe(&self) -> (Vec<ObserverMessage>, broadcast::Receiver<ObserverMessage>) {
        let receiver = self.observers.subscribe();
        let mut initial = vec![ObserverMessage::Status(self.status_snapshot().await)];
        let pending_qr = self.session.read().await.qr().cloned();
        if let Some(qr) = pending_qr {
            if let Ok(url) = render_data_url(&qr) {
                initial.push(ObserverMessage::Qr(url));
            }
        }
        (initial, receiver)
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let api_key = self
            .api_key
            .read()
            .await
            .as_ref()
            .map(|key| key.as_str().to_string());
        let session = self.session.read().await;
        StatusSnapshot {
            ready: session.is_ready(),
            api_key,
            state: session.state(),
        }
    }

    pub async fn status_report(&self) -> StatusReport {
        let session = self.session.read().await;
        StatusReport {
            session_id: self.config.session_id.to_string(),
            ready: session.is_ready(),
            state: session.state(),
            generation: session.generation(),
            reconnect_attempts: session.reconnect_attempts(),
            reconnect_pending: self.scheduler.is_pending(),
            pairing: session.qr().is_some(),
            last_error: session.last_error().map(str::to_string),
            last_transition_at: session.last_transition_at(),
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.session.read().await.is_ready()
    }

    pub async fn is_healthy(&self) -> bool {
        self.session.read().await.state() != ConnectionState::Failed
    }

    async fn broadcast_status(&self) {
        let snapshot = self.status_snapshot().await;
        self.broadcast(ObserverMessage::Status(snapshot));
    }

    fn broadcast(&self, message: ObserverMessage) {
        // No observers connected is not an error.
        let _ = self.observers.send(message);
    }

    fn record(&self, envelope: &SessionEventEnvelope) {
        match &envelope.event {
            SessionDomainEvent::StateChanged { from, to, trigger } => {
                debug!(
                    generation = envelope.generation,
                    from = from.as_str(),
                    to = to.as_str(),
                    ?trigger,
                    "session transition"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_transition(from.as_str(), to.as_str());
                }
            }
            SessionDomainEvent::QrIssued => {
                debug!(generation = envelope.generation, "pairing QR stored");
            }
            SessionDomainEvent::ReconnectAttemptRecorded { attempt } => {
                debug!(generation = envelope.generation, attempt, "reconnect attempt recorded");
            }
        }
    }

    /// Stops the event loop, cancels timers and releases the client.
    pub async fn shutdown(&self) {
        self.scheduler.cancel();
        let _ = self.commands_tx.send(BridgeCommand::Shutdown);
        let handle = self.event_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut handle) = handle {
            if timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("event loop did not stop in time; aborting");
                handle.abort();
            }
        }
        let client = self.client.write().await.take();
        if let Some(client) = client {
            if let Err(err) = client.destroy().await {
                warn!(%err, "tearing down client on shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::session::{InMemoryAuthStateRepository, InMemorySessionKeyRepository};
    use crate::domain::session::{ChatId, PairingQr, SessionRecord};
    use crate::ports::chat::ChatClientError;
    use crate::ports::session::AuthState;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeGateway {
        sinks: Mutex<Vec<ClientEventSink>>,
        fail_initialize: AtomicBool,
        hold_initialize: AtomicBool,
        release_initialize: Notify,
        fail_reject: AtomicBool,
        rejected: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, String)>>,
        logouts: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl FakeGateway {
        fn created(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }

        fn emit_from(&self, index: usize, event: ClientEvent) {
            self.sinks.lock().unwrap()[index].emit(event);
        }

        fn emit_latest(&self, event: ClientEvent) {
            let sinks = self.sinks.lock().unwrap();
            sinks.last().expect("a client was created").emit(event);
        }
    }

    struct FakeClient {
        gateway: Arc<FakeGateway>,
        auth: RemoteAuth,
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        async fn initialize(&self) -> Result<(), ChatClientError> {
            if self.gateway.fail_initialize.load(Ordering::SeqCst) {
                return Err(ChatClientError::Transport("gateway down".into()));
            }
            if self.gateway.hold_initialize.load(Ordering::SeqCst) {
                self.gateway.release_initialize.notified().await;
                self.auth
                    .store
                    .save(AuthState::new(
                        self.auth.session_id.clone(),
                        json!({"instanceName": "wabridge", "state": "connecting"}),
                    ))
                    .await
                    .map_err(|err| ChatClientError::Transport(err.to_string()))?;
            }
            Ok(())
        }

        async fn logout(&self) -> Result<(), ChatClientError> {
            self.gateway.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self) -> Result<(), ChatClientError> {
            self.gateway.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resolve_number(
            &self,
            phone: &PhoneNumber,
        ) -> Result<Option<ChatId>, ChatClientError> {
            if phone.digits().starts_with("1555") {
                return Ok(Some(
                    ChatId::new(format!("{}@s.whatsapp.net", phone.digits())).unwrap(),
                ));
            }
            Ok(None)
        }

        async fn send_text(
            &self,
            to: &ChatId,
            text: &str,
        ) -> Result<MessageReceipt, ChatClientError> {
            if text == "explode" {
                return Err(ChatClientError::Gateway {
                    status: 500,
                    body: "boom".into(),
                });
            }
            self.gateway
                .sent
                .lock()
                .unwrap()
                .push((to.as_str().to_string(), text.to_string()));
            Ok(MessageReceipt {
                id: "MSG-1".into(),
                to: to.clone(),
                timestamp: Utc::now(),
                raw: json!({"key": {"id": "MSG-1"}}),
            })
        }

        async fn reject_call(&self, call: &IncomingCall) -> Result<(), ChatClientError> {
            if self.gateway.fail_reject.load(Ordering::SeqCst) {
                return Err(ChatClientError::Transport("reject failed".into()));
            }
            self.gateway.rejected.lock().unwrap().push(call.id.clone());
            Ok(())
        }
    }

    struct FakeFactory(Arc<FakeGateway>);

    impl ChatClientFactory for FakeFactory {
        fn create(
            &self,
            auth: RemoteAuth,
            events: ClientEventSink,
        ) -> Result<Arc<dyn ChatClient>, ChatClientError> {
            self.0.sinks.lock().unwrap().push(events);
            Ok(Arc::new(FakeClient {
                gateway: Arc::clone(&self.0),
                auth,
            }))
        }
    }

    struct Fixture {
        service: Arc<BridgeService>,
        gateway: Arc<FakeGateway>,
        keys: Arc<InMemorySessionKeyRepository>,
        auth: Arc<InMemoryAuthStateRepository>,
    }

    fn config(policy: ReconnectPolicy) -> BridgeConfig {
        BridgeConfig {
            session_id: SessionName::new("whatsapp").unwrap(),
            reconnect: policy,
            auth_backup_interval: Duration::from_secs(300),
        }
    }

    fn start_with(
        keys: Arc<InMemorySessionKeyRepository>,
        gateway: Arc<FakeGateway>,
        policy: ReconnectPolicy,
    ) -> Fixture {
        let auth = Arc::new(InMemoryAuthStateRepository::new());
        let service = BridgeService::start(
            config(policy),
            BridgeStores {
                keys: keys.clone(),
                auth: auth.clone(),
            },
            Arc::new(FakeFactory(Arc::clone(&gateway))),
            None,
        );
        Fixture {
            service,
            gateway,
            keys,
            auth,
        }
    }

    fn start() -> Fixture {
        start_with(
            Arc::new(InMemorySessionKeyRepository::new()),
            Arc::new(FakeGateway::default()),
            ReconnectPolicy::default(),
        )
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(600), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    async fn until_created(fixture: &Fixture, count: usize) {
        let gateway = Arc::clone(&fixture.gateway);
        eventually(move || {
            let gateway = Arc::clone(&gateway);
            async move { gateway.created() >= count }
        })
        .await;
    }

    async fn until_state(fixture: &Fixture, state: ConnectionState) {
        let service = Arc::clone(&fixture.service);
        eventually(move || {
            let service = Arc::clone(&service);
            async move { service.status_snapshot().await.state == state }
        })
        .await;
    }

    async fn ready(fixture: &Fixture) -> String {
        until_created(fixture, 1).await;
        fixture.gateway.emit_latest(ClientEvent::Authenticated);
        fixture.gateway.emit_latest(ClientEvent::Ready);
        until_state(fixture, ConnectionState::Ready).await;
        fixture
            .service
            .status_snapshot()
            .await
            .api_key
            .expect("api key after bootstrap")
    }

    fn request(api_key: &str, phone: Option<&str>, message: Option<&str>) -> SendMessageRequest {
        SendMessageRequest {
            api_key: Some(api_key.to_string()),
            phone_number: phone.map(str::to_string),
            message: message.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn restart_reuses_stored_api_key() {
        let keys = Arc::new(InMemorySessionKeyRepository::new());
        let first = start_with(
            keys.clone(),
            Arc::new(FakeGateway::default()),
            ReconnectPolicy::default(),
        );
        let key = ready(&first).await;
        first.service.shutdown().await;

        let second = start_with(
            keys,
            Arc::new(FakeGateway::default()),
            ReconnectPolicy::default(),
        );
        until_created(&second, 1).await;
        let snapshot = second.service.status_snapshot().await;
        assert_eq!(snapshot.api_key.as_deref(), Some(key.as_str()));
        assert!(!snapshot.ready);
        second.service.shutdown().await;
    }

    #[tokio::test]
    async fn qr_and_ready_reach_observers() {
        let fixture = start();
        until_created(&fixture, 1).await;
        let (initial, mut rx) = fixture.service.subscribe().await;
        let ObserverMessage::Status(status) = &initial[0] else {
            panic!("status must come first");
        };
        assert!(!status.ready);
        assert!(status.api_key.is_some());

        let qr = PairingQr::new(Some("2@pairing".into()), None).unwrap();
        fixture.gateway.emit_latest(ClientEvent::Qr(qr));
        let ObserverMessage::Qr(url) = rx.recv().await.unwrap() else {
            panic!("expected qr frame");
        };
        assert!(url.starts_with("data:image/svg+xml;base64,"));
        assert_eq!(
            fixture.service.status_snapshot().await.state,
            ConnectionState::Pairing
        );

        let (late_initial, _) = fixture.service.subscribe().await;
        assert!(matches!(late_initial.get(1), Some(ObserverMessage::Qr(_))));

        fixture.gateway.emit_latest(ClientEvent::Ready);
        let ObserverMessage::Status(status) = rx.recv().await.unwrap() else {
            panic!("expected status frame");
        };
        assert!(status.ready);
        assert_eq!(status.state, ConnectionState::Ready);
        assert!(!fixture.service.status_report().await.pairing);
    }

    #[tokio::test]
    async fn send_message_checks_run_in_order() {
        let fixture = start();
        until_created(&fixture, 1).await;
        let key = fixture
            .service
            .status_snapshot()
            .await
            .api_key
            .unwrap();

        let wrong = fixture
            .service
            .send_message(request("nope", Some("+15550100"), Some("hi")))
            .await;
        assert!(matches!(wrong, Err(BridgeError::InvalidApiKey)));
        let not_ready = fixture
            .service
            .send_message(request(&key, Some("+15550100"), Some("hi")))
            .await;
        assert!(matches!(not_ready, Err(BridgeError::NotReady)));

        ready(&fixture).await;
        let wrong = fixture
            .service
            .send_message(request("nope", None, None))
            .await;
        assert!(matches!(wrong, Err(BridgeError::InvalidApiKey)));
        let missing = fixture
            .service
            .send_message(request(&key, Some("+15550100"), Some("   ")))
            .await;
        assert!(matches!(missing, Err(BridgeError::MissingFields(_))));
        let invalid = fixture
            .service
            .send_message(request(&key, Some("call-me"), Some("hi")))
            .await;
        assert!(matches!(invalid, Err(BridgeError::InvalidPhoneNumber(_))));
        let unknown = fixture
            .service
            .send_message(request(&key, Some("+44 20 7946 0000"), Some("hi")))
            .await;
        assert!(matches!(unknown, Err(BridgeError::UnknownRecipient(_))));
        let failed = fixture
            .service
            .send_message(request(&key, Some("+15550100"), Some("explode")))
            .await;
        assert!(matches!(failed, Err(BridgeError::Dispatch(_))));

        let receipt = fixture
            .service
            .send_message(request(&key, Some("+1 555 0100"), Some("hello")))
            .await
            .unwrap();
        assert_eq!(receipt.id, "MSG-1");
        assert_eq!(
            fixture.gateway.sent.lock().unwrap().as_slice(),
            &[("15550100@s.whatsapp.net".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_schedules_exactly_one_rebootstrap() {
        let fixture = start();
        ready(&fixture).await;

        let disconnected_at = Instant::now();
        fixture.gateway.emit_latest(ClientEvent::Disconnected {
            reason: "socket closed".into(),
        });
        fixture.gateway.emit_latest(ClientEvent::Disconnected {
            reason: "socket closed again".into(),
        });
        let probe = Arc::clone(&fixture.service);
        eventually(move || {
            let probe = Arc::clone(&probe);
            async move { probe.status_report().await.reconnect_pending }
        })
        .await;
        assert!(!fixture.service.is_ready().await);
        let report = fixture.service.status_report().await;
        assert!(report.reconnect_pending);
        assert_eq!(report.reconnect_attempts, 1);
        assert!(fixture.gateway.destroys.load(Ordering::SeqCst) >= 1);

        until_created(&fixture, 2).await;
        let waited = disconnected_at.elapsed();
        assert!(waited >= Duration::from_millis(5_000), "rebootstrap after {waited:?}");
        assert!(waited <= Duration::from_millis(6_100), "rebootstrap after {waited:?}");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fixture.gateway.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_events_are_ignored() {
        let fixture = start();
        ready(&fixture).await;
        fixture.gateway.emit_latest(ClientEvent::Disconnected {
            reason: "drop".into(),
        });
        until_created(&fixture, 2).await;

        fixture.gateway.emit_from(0, ClientEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fixture.service.is_ready().await);

        fixture.gateway.emit_latest(ClientEvent::Ready);
        until_state(&fixture, ConnectionState::Ready).await;
        assert_eq!(fixture.service.status_report().await.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_session_failed() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.fail_initialize.store(true, Ordering::SeqCst);
        let fixture = start_with(
            Arc::new(InMemorySessionKeyRepository::new()),
            gateway,
            ReconnectPolicy {
                max_attempts: 2,
                ..ReconnectPolicy::default()
            },
        );

        until_state(&fixture, ConnectionState::Failed).await;
        assert_eq!(fixture.gateway.created(), 3);
        assert!(!fixture.service.is_healthy().await);
        let report = fixture.service.status_report().await;
        assert!(!report.reconnect_pending);
        assert!(report.last_error.unwrap().contains("gave up"));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_store_failure_flows_into_reconnect() {
        struct BrokenKeys;

        #[async_trait]
        impl SessionKeyRepository for BrokenKeys {
            async fn find(
                &self,
                _session_id: &SessionName,
            ) -> anyhow::Result<Option<SessionRecord>> {
                Err(anyhow::anyhow!("database unreachable"))
            }

            async fn insert_if_absent(
                &self,
                record: SessionRecord,
            ) -> anyhow::Result<SessionRecord> {
                Ok(record)
            }
        }

        let gateway = Arc::new(FakeGateway::default());
        let service = BridgeService::start(
            config(ReconnectPolicy::default()),
            BridgeStores {
                keys: Arc::new(BrokenKeys),
                auth: Arc::new(InMemoryAuthStateRepository::new()),
            },
            Arc::new(FakeFactory(Arc::clone(&gateway))),
            None,
        );
        let probe = Arc::clone(&service);
        eventually(move || {
            let probe = Arc::clone(&probe);
            async move { probe.status_report().await.reconnect_pending }
        })
        .await;
        let report = service.status_report().await;
        assert_eq!(report.state, ConnectionState::Disconnected);
        assert!(report.last_error.unwrap().contains("database unreachable"));
        assert_eq!(gateway.created(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn calls_are_rejected_without_touching_state() {
        let fixture = start();
        ready(&fixture).await;
        fixture.gateway.emit_latest(ClientEvent::Call(IncomingCall {
            id: "CALL-1".into(),
            from: "15550100@s.whatsapp.net".into(),
            is_video: false,
        }));
        let gateway = Arc::clone(&fixture.gateway);
        eventually(move || {
            let gateway = Arc::clone(&gateway);
            async move { gateway.rejected.lock().unwrap().contains(&"CALL-1".to_string()) }
        })
        .await;

        fixture.gateway.fail_reject.store(true, Ordering::SeqCst);
        fixture.gateway.emit_latest(ClientEvent::Call(IncomingCall {
            id: "CALL-2".into(),
            from: "15550100@s.whatsapp.net".into(),
            is_video: true,
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.service.is_ready().await);
        assert_eq!(fixture.gateway.rejected.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_retires_client_and_schedules_pairing() {
        let fixture = start();
        ready(&fixture).await;
        fixture
            .auth
            .save(AuthState::new(
                SessionName::new("whatsapp").unwrap(),
                json!({"instanceName": "wabridge"}),
            ))
            .await
            .unwrap();
        let (_, mut rx) = fixture.service.subscribe().await;

        let started = Instant::now();
        fixture.service.logout().await;
        assert!(!fixture.service.is_ready().await);
        let ObserverMessage::Status(status) = rx.recv().await.unwrap() else {
            panic!("expected status frame");
        };
        assert!(!status.ready);
        assert_eq!(fixture.gateway.logouts.load(Ordering::SeqCst), 1);
        assert!(fixture
            .auth
            .load(&SessionName::new("whatsapp").unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(fixture.service.status_report().await.reconnect_pending);

        until_created(&fixture, 2).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            fixture.service.status_snapshot().await.state,
            ConnectionState::Uninitialized
        );
        assert!(fixture.keys.find(&SessionName::new("whatsapp").unwrap()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn logout_waits_for_bootstrap_in_flight() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.hold_initialize.store(true, Ordering::SeqCst);
        let fixture = start_with(
            Arc::new(InMemorySessionKeyRepository::new()),
            gateway,
            ReconnectPolicy::default(),
        );
        until_created(&fixture, 1).await;

        let service = Arc::clone(&fixture.service);
        let logout = tokio::spawn(async move { service.logout().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!logout.is_finished());

        fixture.gateway.release_initialize.notify_one();
        timeout(Duration::from_secs(5), logout)
            .await
            .expect("logout completes")
            .unwrap();

        let session = SessionName::new("whatsapp").unwrap();
        assert!(fixture.auth.load(&session).await.unwrap().is_none());
        assert_eq!(fixture.gateway.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.gateway.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.gateway.created(), 1);

        fixture.gateway.emit_from(0, ClientEvent::Ready);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fixture.service.is_ready().await);
        let report = fixture.service.status_report().await;
        assert_eq!(report.state, ConnectionState::Disconnected);
        assert!(report.reconnect_pending);
        fixture.service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_and_disconnected_reach_observers() {
        let fixture = start();
        until_created(&fixture, 1).await;
        let (_, mut rx) = fixture.service.subscribe().await;

        fixture.gateway.emit_latest(ClientEvent::Authenticated);
        let ObserverMessage::Status(status) = rx.recv().await.unwrap() else {
            panic!("expected status frame");
        };
        assert!(!status.ready);
        assert_eq!(status.state, ConnectionState::Authenticated);
        assert!(status.api_key.is_some());

        fixture.gateway.emit_latest(ClientEvent::Disconnected {
            reason: "stream errored".into(),
        });
        let ObserverMessage::Status(status) = rx.recv().await.unwrap() else {
            panic!("expected status frame");
        };
        assert!(!status.ready);
        assert_eq!(status.state, ConnectionState::Disconnected);
        fixture.service.shutdown().await;
    }

    #[tokio::test]
    async fn logout_before_any_client_still_succeeds() {
        let fixture = start();
        fixture.service.logout().await;
        assert!(!fixture.service.is_ready().await);
        fixture.service.shutdown().await;
        assert!(!fixture.service.status_report().await.reconnect_pending);
    }
}
