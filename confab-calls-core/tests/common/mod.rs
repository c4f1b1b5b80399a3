//! Shared test doubles and harness for controller integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use confab_calls_core::{
    AuthToken, CallControllerHandle, CallController, CallEvent, CallHistory, CallId, CallKind,
    CallRecord, CallRole, CallSummary, CallerInfo, ClientEvent, ControllerConfig,
    DescriptionKind, EngineConnectionState, EngineFactory, IncomingCallOffer, LocalMedia,
    MediaAcquisitionError, MediaConstraints, MediaDevices, MediaStreamHandle, NegotiationEngine,
    NegotiationState, NotificationId, Notifier, RemoteCandidate, ServerEvent, SessionDescription,
    SessionError, SignalEnvelope, SignalingChannel, SignalingConfig, SignalingTransport,
    SignalKind, SoundKind, TrackHandle, TrackKind, UserId,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};

#[derive(Debug, Error)]
#[error("test transport error")]
pub struct TestTransportError;

pub enum Inbound {
    Event(ServerEvent),
    Drop,
}

/// Signaling transport double. Events are pushed from the test body; a
/// `Drop` marker makes the next receive fail, simulating connection loss.
pub struct TestTransport {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
    pub sent: Mutex<Vec<ClientEvent>>,
    pub connects: AtomicUsize,
}

impl TestTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.inbound_tx.send(Inbound::Event(event));
    }

    pub fn push_drop(&self) {
        let _ = self.inbound_tx.send(Inbound::Drop);
    }

    pub fn sent_events(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_sent(&self, f: impl Fn(&ClientEvent) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|e| f(e)).count()
    }
}

#[async_trait]
impl SignalingTransport for TestTransport {
    type Error = TestTransportError;

    async fn connect(&self, _token: &AuthToken) -> Result<(), TestTransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_event(&self, event: ClientEvent) -> Result<(), TestTransportError> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn receive_event(&self) -> Result<ServerEvent, TestTransportError> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(Inbound::Event(event)) => Ok(event),
            Some(Inbound::Drop) => Err(TestTransportError),
            // Channel closed: park forever so the receive loop idles
            None => std::future::pending().await,
        }
    }
}

/// Media devices double with a switchable failure mode.
pub struct TestDevices {
    pub acquisitions: AtomicUsize,
    pub releases: AtomicUsize,
    fail_mode: Mutex<Option<MediaAcquisitionError>>,
}

impl TestDevices {
    pub fn new() -> Self {
        Self {
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail_mode: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, err: MediaAcquisitionError) {
        *self.fail_mode.lock().unwrap() = Some(err);
    }

    pub fn succeed(&self) {
        *self.fail_mode.lock().unwrap() = None;
    }
}

#[async_trait]
impl MediaDevices for TestDevices {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError> {
        if let Some(err) = self.fail_mode.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia {
            stream: MediaStreamHandle {
                id: format!("local-{n}"),
            },
            audio_track: constraints.audio.then(|| TrackHandle {
                id: format!("audio-{n}"),
                kind: TrackKind::Audio,
            }),
            video_track: constraints.video.then(|| TrackHandle {
                id: format!("video-{n}"),
                kind: TrackKind::Video,
            }),
        })
    }

    async fn acquire_video_track(
        &self,
        device_id: &str,
    ) -> Result<TrackHandle, MediaAcquisitionError> {
        if let Some(err) = self.fail_mode.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(TrackHandle {
            id: format!("video-{device_id}"),
            kind: TrackKind::Video,
        })
    }

    async fn stop_track(&self, _track: &TrackHandle) {}

    async fn release(&self, _media: &LocalMedia) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Negotiation engine double. Counters record what the controller drove it
/// to do; `push_state` feeds connection state changes back.
pub struct TestEngine {
    pub offers_created: AtomicUsize,
    pub offers_accepted: AtomicUsize,
    pub answers_applied: AtomicUsize,
    pub candidates_applied: AtomicUsize,
    pub ice_restarts: AtomicUsize,
    pub closed: AtomicBool,
    pub fail_restart: AtomicBool,
    state: Mutex<NegotiationState>,
    states_tx: broadcast::Sender<EngineConnectionState>,
}

impl TestEngine {
    pub fn new() -> Self {
        let (states_tx, _) = broadcast::channel(16);
        Self {
            offers_created: AtomicUsize::new(0),
            offers_accepted: AtomicUsize::new(0),
            answers_applied: AtomicUsize::new(0),
            candidates_applied: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_restart: AtomicBool::new(false),
            state: Mutex::new(NegotiationState::Stable),
            states_tx,
        }
    }

    pub fn push_state(&self, state: EngineConnectionState) {
        let _ = self.states_tx.send(state);
    }
}

#[async_trait]
impl NegotiationEngine for TestEngine {
    async fn attach_media(&self, _media: &LocalMedia) -> Result<(), SessionError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = NegotiationState::HaveLocalOffer;
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            data: serde_json::json!({"sdp": "local-offer"}),
        })
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.offers_accepted.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = NegotiationState::Stable;
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            data: serde_json::json!({"sdp": "local-answer"}),
        })
    }

    async fn apply_answer(&self, _answer: SessionDescription) -> Result<(), SessionError> {
        self.answers_applied.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = NegotiationState::Stable;
        Ok(())
    }

    async fn apply_remote_candidate(
        &self,
        _candidate: RemoteCandidate,
    ) -> Result<(), SessionError> {
        self.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_video_track(&self, _track: &TrackHandle) -> Result<(), SessionError> {
        Ok(())
    }

    async fn set_track_enabled(
        &self,
        _kind: TrackKind,
        _enabled: bool,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), SessionError> {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(SessionError::Negotiation("restart failed".to_owned()));
        }
        Ok(())
    }

    fn negotiation_state(&self) -> NegotiationState {
        *self.state.lock().unwrap()
    }

    fn remote_stream(&self) -> Option<MediaStreamHandle> {
        Some(MediaStreamHandle {
            id: "remote-0".to_owned(),
        })
    }

    fn connection_states(&self) -> broadcast::Receiver<EngineConnectionState> {
        self.states_tx.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct TestEngineFactory {
    pub engine: Arc<TestEngine>,
    pub created: AtomicUsize,
}

impl EngineFactory for TestEngineFactory {
    fn create_engine(
        &self,
        _call_id: &CallId,
    ) -> Result<Arc<dyn NegotiationEngine>, SessionError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone())
    }
}

/// Notifier double counting what was shown and dismissed.
pub struct TestNotifier {
    pub shown: AtomicUsize,
    pub dismissed: AtomicUsize,
    pub statuses: Mutex<Vec<(String, String)>>,
}

impl TestNotifier {
    pub fn new() -> Self {
        Self {
            shown: AtomicUsize::new(0),
            dismissed: AtomicUsize::new(0),
            statuses: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Notifier for TestNotifier {
    async fn show_incoming_call(
        &self,
        _caller_name: &str,
        offer: &IncomingCallOffer,
    ) -> Option<NotificationId> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        Some(NotificationId(format!("notif-{}", offer.call_id)))
    }

    async fn dismiss_notification(&self, _id: &NotificationId) {
        self.dismissed.fetch_add(1, Ordering::SeqCst);
    }

    async fn show_status(&self, title: &str, message: &str) {
        self.statuses
            .lock()
            .unwrap()
            .push((title.to_owned(), message.to_owned()));
    }

    async fn play_sound(&self, _kind: SoundKind, _looped: bool) {}

    async fn stop_sound(&self, _kind: SoundKind) {}
}

/// History double serving a fixed record list.
pub struct TestHistory {
    pub records: Mutex<Vec<CallRecord>>,
}

impl TestHistory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CallHistory for TestHistory {
    async fn fetch_call_history(&self) -> anyhow::Result<Vec<CallRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// Fully wired controller with all doubles exposed.
pub struct Harness {
    pub calls: CallControllerHandle,
    pub channel: Arc<SignalingChannel<TestTransport>>,
    pub transport: Arc<TestTransport>,
    pub devices: Arc<TestDevices>,
    pub engine: Arc<TestEngine>,
    pub notifier: Arc<TestNotifier>,
    pub history: Arc<TestHistory>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut ControllerConfig)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let transport = Arc::new(TestTransport::new());
        let channel = Arc::new(SignalingChannel::new(
            transport.clone(),
            SignalingConfig::default(),
        ));
        channel
            .start(AuthToken::new("test-token"))
            .await
            .expect("channel start");

        let devices = Arc::new(TestDevices::new());
        let engine = Arc::new(TestEngine::new());
        let factory = Arc::new(TestEngineFactory {
            engine: engine.clone(),
            created: AtomicUsize::new(0),
        });

        let notifier = Arc::new(TestNotifier::new());
        let history = Arc::new(TestHistory::new());
        let mut config = ControllerConfig::new(UserId::new("local"));
        configure(&mut config);
        let calls = CallController::spawn(
            config,
            channel.clone(),
            devices.clone(),
            factory,
            notifier.clone(),
            history.clone(),
        );
        let events = calls.subscribe();
        Self {
            calls,
            channel,
            transport,
            devices,
            engine,
            notifier,
            history,
            events,
        }
    }

    /// Collect every buffered controller event
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// States seen since the last drain, in order
    pub fn drain_states(&mut self) -> Vec<(CallId, confab_calls_core::CallState)> {
        self.drain_events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { call_id, state } => Some((call_id, state)),
                _ => None,
            })
            .collect()
    }
}

/// Yield repeatedly so queued events propagate through the forwarder
/// tasks and the controller loop without moving the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn summary(call_id: &CallId, caller: &str, receiver: &str, kind: CallKind) -> CallSummary {
    CallSummary {
        call_id: call_id.clone(),
        kind,
        caller_id: UserId::new(caller),
        receiver_id: UserId::new(receiver),
    }
}

pub fn accepted(call_id: &CallId, caller: &str, receiver: &str) -> ServerEvent {
    ServerEvent::Accepted {
        call_id: call_id.clone(),
        call: summary(call_id, caller, receiver, CallKind::Voice),
        accepted_by: UserId::new(receiver),
        role: Some(CallRole::Caller),
    }
}

pub fn incoming(call_id: &str, caller: &str, kind: CallKind) -> ServerEvent {
    let call_id = CallId::from(call_id);
    ServerEvent::Incoming {
        call_id: call_id.clone(),
        call: summary(&call_id, caller, "local", kind),
        caller: CallerInfo {
            user_id: UserId::new(caller),
            display_name: caller.to_owned(),
            avatar_url: None,
        },
    }
}

pub fn answer_envelope(call_id: &CallId) -> ServerEvent {
    ServerEvent::Answer(SignalEnvelope {
        call_id: call_id.clone(),
        kind: SignalKind::Answer,
        data: serde_json::json!({"sdp": "remote-answer"}),
        target_user_id: None,
    })
}

pub fn offer_envelope(call_id: &CallId) -> ServerEvent {
    ServerEvent::Offer(SignalEnvelope {
        call_id: call_id.clone(),
        kind: SignalKind::Offer,
        data: serde_json::json!({"sdp": "remote-offer"}),
        target_user_id: None,
    })
}

pub fn candidate_envelope(call_id: &CallId, n: u32) -> ServerEvent {
    ServerEvent::IceCandidate(SignalEnvelope {
        call_id: call_id.clone(),
        kind: SignalKind::IceCandidate,
        data: serde_json::json!({"candidate": format!("candidate:{n}")}),
        target_user_id: None,
    })
}
