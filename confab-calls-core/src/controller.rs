//! Call session controller.
//!
//! Owns the call lifecycle state machine. User commands, signaling
//! events, engine state changes, timers and recovery deadlines all
//! funnel into one queue processed by a single loop task, so every state
//! transition is serialized and validated in one place. The signaling
//! server delivers at least once; every remote event is deduplicated by
//! content fingerprint before it can touch state, and calls that reached a
//! terminal state are tombstoned so late redeliveries cannot resurrect
//! them.

use crate::collaborators::{CallHistory, NotificationId, Notifier, SoundKind};
use crate::recovery::{
    CallErrorKind, QualityMonitor, RecoveryDecision, RecoveryIntent, RecoveryManager,
    RecoveryPolicy,
};
use crate::session::{
    EngineConnectionState, EngineFactory, MediaAcquisitionError, MediaConstraints, MediaDevices,
    MediaStreamHandle, RealtimeSession, RemoteCandidate, SessionDescription, SessionError,
};
use crate::signaling::{ClientEvent, ServerEvent, SignalingChannel, SignalingError,
    SignalingTransport};
use crate::store::CallStateStore;
use crate::types::{
    CallId, CallKind, CallRole, CallSession, CallState, ConnectionQualitySample,
    IncomingCallOffer, MediaStatus, QualityLevel, SignalEnvelope, SignalKind, UserId,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Errors returned by controller commands
#[derive(Error, Debug)]
pub enum CallError {
    /// No ringing or active call with this id
    #[error("no call with id {0}")]
    NotFound(CallId),

    /// The command is not valid in the current call state
    #[error("operation invalid in state {state}")]
    InvalidState {
        /// State the call was in when the command arrived
        state: CallState,
    },

    /// A call is already ringing or in progress
    #[error("another call is already in progress")]
    Busy,

    /// Local media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    /// Realtime session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Signaling channel failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The controller loop has shut down
    #[error("call controller closed")]
    Closed,
}

/// Controller tuning knobs
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The local user, for role resolution and media-status attribution
    pub local_user: UserId,
    /// How long an unanswered call rings before it is abandoned
    pub ring_timeout: Duration,
    /// How long negotiation may take before the call fails
    pub connecting_timeout: Duration,
    /// Window in which repeated accept/reject taps are swallowed
    pub decision_debounce: Duration,
    /// Remote-event fingerprints remembered per call
    pub max_fingerprints_per_call: usize,
    /// Finished call ids remembered for late-redelivery suppression; also
    /// caps how many calls may hold dedup fingerprint sets at once
    pub max_tombstones: usize,
    /// Retry budget and backoff shape
    pub recovery: RecoveryPolicy,
    /// Consecutive poor quality samples before recovery engages
    pub quality_poor_threshold: u32,
    /// Capacity of the outgoing event channel
    pub event_buffer: usize,
}

impl ControllerConfig {
    /// Defaults for the given local user
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            ring_timeout: Duration::from_secs(30),
            connecting_timeout: Duration::from_secs(30),
            decision_debounce: Duration::from_secs(2),
            max_fingerprints_per_call: 256,
            max_tombstones: 128,
            recovery: RecoveryPolicy::default(),
            quality_poor_threshold: 3,
            event_buffer: 64,
        }
    }
}

/// Events emitted to the application
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A peer is calling; the offer is also readable from the store
    IncomingCall {
        /// The ringing offer
        offer: IncomingCallOffer,
    },
    /// The call moved to a new state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
    },
    /// The call failed; emitted alongside the `Failed` state change
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Classified failure
        kind: CallErrorKind,
    },
    /// A participant's media flags changed
    MediaStatusChanged {
        /// Call identifier
        call_id: CallId,
        /// Whose flags changed
        user_id: UserId,
        /// New flags
        media: MediaStatus,
    },
    /// Connection quality classification changed
    QualityChanged {
        /// Call identifier
        call_id: CallId,
        /// New level
        level: QualityLevel,
    },
    /// Remote media arrived
    RemoteStreamReady {
        /// Call identifier
        call_id: CallId,
        /// Remote stream handle
        stream: MediaStreamHandle,
    },
    /// Signaling connectivity changed
    SignalingConnection {
        /// Whether the channel is connected
        connected: bool,
    },
}

enum Command {
    Initiate {
        receiver_id: UserId,
        kind: CallKind,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    ToggleAudio {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ReplaceVideoTrack {
        device_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown,
}

enum LoopEvent {
    Command(Command),
    Signal(ServerEvent),
    Engine {
        call_id: CallId,
        state: EngineConnectionState,
    },
    ChannelStatus(bool),
    RingTimeout {
        call_id: CallId,
    },
    ConnectingTimeout {
        call_id: CallId,
    },
    RecoveryDue {
        call_id: CallId,
        kind: CallErrorKind,
        intent: RecoveryIntent,
    },
    QualitySample {
        sample: ConnectionQualitySample,
    },
}

/// Handle to a running controller.
///
/// Cheap to clone. Commands are executed on the controller loop and their
/// results returned here; the handle never touches call state directly.
#[derive(Clone)]
pub struct CallControllerHandle {
    tx: mpsc::Sender<LoopEvent>,
    events: broadcast::Sender<CallEvent>,
    store: CallStateStore,
    history: Arc<dyn CallHistory>,
}

impl CallControllerHandle {
    /// Place a call to `receiver_id`; returns the minted call id
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a call is already in progress, or a
    /// signaling error if the initiate message cannot be sent.
    pub async fn initiate(
        &self,
        receiver_id: UserId,
        kind: CallKind,
    ) -> Result<CallId, CallError> {
        self.roundtrip(|reply| Command::Initiate {
            receiver_id,
            kind,
            reply,
        })
        .await
    }

    /// Accept the ringing incoming call.
    ///
    /// Repeated calls within the debounce window are swallowed and return
    /// `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotFound`] if no such offer is ringing.
    pub async fn accept(&self, call_id: CallId) -> Result<(), CallError> {
        self.roundtrip(|reply| Command::Accept { call_id, reply }).await
    }

    /// Reject the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotFound`] if no such offer is ringing.
    pub async fn reject(&self, call_id: CallId) -> Result<(), CallError> {
        self.roundtrip(|reply| Command::Reject { call_id, reply }).await
    }

    /// Hang up the current call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if no call is in progress.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.roundtrip(|reply| Command::End { reply }).await
    }

    /// Toggle the microphone; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if no session is established.
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.roundtrip(|reply| Command::ToggleAudio { reply }).await
    }

    /// Toggle the camera; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if no session is established.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.roundtrip(|reply| Command::ToggleVideo { reply }).await
    }

    /// Switch the camera to a different capture device
    ///
    /// # Errors
    ///
    /// Returns [`CallError::InvalidState`] if no session is established,
    /// or the acquisition/engine error on failure.
    pub async fn replace_video_track(&self, device_id: impl Into<String>) -> Result<(), CallError> {
        let device_id = device_id.into();
        self.roundtrip(|reply| Command::ReplaceVideoTrack { device_id, reply })
            .await
    }

    /// Feed a periodic connection-quality sample
    pub async fn report_quality(&self, sample: ConnectionQualitySample) {
        let _ = self.tx.send(LoopEvent::QualitySample { sample }).await;
    }

    /// Subscribe to controller events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Read-only view of call state
    #[must_use]
    pub fn store(&self) -> &CallStateStore {
        &self.store
    }

    /// Fetch the persisted call history, newest first
    ///
    /// # Errors
    ///
    /// Propagates the history collaborator's error.
    pub async fn call_history(&self) -> anyhow::Result<Vec<crate::types::CallRecord>> {
        self.history.fetch_call_history().await
    }

    /// Stop the controller loop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Command(Command::Shutdown)).await;
    }

    async fn roundtrip<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, CallError>>) -> Command,
    ) -> Result<R, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoopEvent::Command(make(reply)))
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }
}

/// Depth of the controller's internal event queue. Senders back-pressure
/// briefly when the loop is saturated; the outward broadcast side is sized
/// separately via [`ControllerConfig::event_buffer`].
const LOOP_QUEUE_DEPTH: usize = 64;

/// Spawns and wires the controller loop
pub struct CallController;

impl CallController {
    /// Start the controller over an already-started signaling channel.
    ///
    /// Forwards the channel's events and connectivity changes into the
    /// loop and returns a command handle.
    pub fn spawn<T: SignalingTransport>(
        config: ControllerConfig,
        channel: Arc<SignalingChannel<T>>,
        devices: Arc<dyn MediaDevices>,
        engines: Arc<dyn EngineFactory>,
        notifier: Arc<dyn Notifier>,
        history: Arc<dyn CallHistory>,
    ) -> CallControllerHandle {
        let (tx, rx) = mpsc::channel(LOOP_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(config.event_buffer);
        let store = CallStateStore::new();

        let mut signals = channel.subscribe();
        let signal_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(event) => {
                        if signal_tx.send(LoopEvent::Signal(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "signaling event fan-out lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut status = channel.status();
        let status_tx = tx.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let connected = *status.borrow();
                if status_tx
                    .send(LoopEvent::ChannelStatus(connected))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let quality_threshold = config.quality_poor_threshold;
        let recovery = RecoveryManager::new(config.recovery.clone());
        let seen = SeenRegistry::new(config.max_tombstones, config.max_fingerprints_per_call);
        let actor = ControllerLoop {
            config,
            channel,
            devices,
            engines,
            notifier,
            store: store.clone(),
            events: events.clone(),
            tx: tx.clone(),
            session: None,
            recovery,
            quality: QualityMonitor::new(quality_threshold),
            seen,
            tombstones: HashSet::new(),
            tombstone_order: VecDeque::new(),
            last_decision: None,
            incoming_notification: None,
        };
        tokio::spawn(actor.run(rx));

        CallControllerHandle {
            tx,
            events,
            store,
            history,
        }
    }
}

struct ControllerLoop<T: SignalingTransport> {
    config: ControllerConfig,
    channel: Arc<SignalingChannel<T>>,
    devices: Arc<dyn MediaDevices>,
    engines: Arc<dyn EngineFactory>,
    notifier: Arc<dyn Notifier>,
    store: CallStateStore,
    events: broadcast::Sender<CallEvent>,
    tx: mpsc::Sender<LoopEvent>,
    session: Option<RealtimeSession>,
    recovery: RecoveryManager,
    quality: QualityMonitor,
    seen: SeenRegistry,
    tombstones: HashSet<CallId>,
    tombstone_order: VecDeque<CallId>,
    last_decision: Option<(CallId, Instant)>,
    incoming_notification: Option<NotificationId>,
}

#[derive(Default)]
struct SeenFingerprints {
    set: HashSet<[u8; 32]>,
    order: VecDeque<[u8; 32]>,
}

impl SeenFingerprints {
    /// Returns true if the fingerprint was already recorded
    fn check_and_record(&mut self, fp: [u8; 32], cap: usize) -> bool {
        if self.set.contains(&fp) {
            return true;
        }
        self.set.insert(fp);
        self.order.push_back(fp);
        while self.order.len() > cap {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        false
    }
}

/// Per-call fingerprint sets, bounded in both directions: fingerprints per
/// call and tracked calls overall. Events can arrive for call ids we never
/// ring (busy auto-rejects, stray redeliveries), so the oldest call's set is
/// evicted once the cap is reached.
struct SeenRegistry {
    max_calls: usize,
    max_per_call: usize,
    map: HashMap<CallId, SeenFingerprints>,
    order: VecDeque<CallId>,
}

impl SeenRegistry {
    fn new(max_calls: usize, max_per_call: usize) -> Self {
        Self {
            max_calls,
            max_per_call,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if the fingerprint was already recorded for this call
    fn check_and_record(&mut self, call_id: &CallId, fp: [u8; 32]) -> bool {
        if !self.map.contains_key(call_id) {
            while self.map.len() >= self.max_calls {
                match self.order.pop_front() {
                    Some(old) => {
                        self.map.remove(&old);
                    }
                    None => break,
                }
            }
            self.order.push_back(call_id.clone());
        }
        self.map
            .entry(call_id.clone())
            .or_default()
            .check_and_record(fp, self.max_per_call)
    }

    fn forget(&mut self, call_id: &CallId) {
        self.map.remove(call_id);
        self.order.retain(|id| id != call_id);
    }

    fn tracked_calls(&self) -> usize {
        self.map.len()
    }
}

fn fingerprint(event: &ServerEvent) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(event.kind_name().as_bytes());
    if let Ok(bytes) = serde_json::to_vec(event) {
        hasher.update(&bytes);
    }
    *hasher.finalize().as_bytes()
}

fn map_media_error(err: &MediaAcquisitionError) -> CallErrorKind {
    match err {
        MediaAcquisitionError::PermissionDenied => CallErrorKind::MediaPermissionDenied,
        MediaAcquisitionError::DeviceNotFound => CallErrorKind::MediaDeviceNotFound,
        MediaAcquisitionError::DeviceBusy => CallErrorKind::MediaDeviceInUse,
        MediaAcquisitionError::Unknown(_) => CallErrorKind::MediaStreamFailed,
    }
}

impl<T: SignalingTransport> ControllerLoop<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<LoopEvent>) {
        tracing::info!(local_user = %self.config.local_user, "call controller started");
        while let Some(event) = rx.recv().await {
            match event {
                LoopEvent::Command(Command::Shutdown) => break,
                LoopEvent::Command(cmd) => self.handle_command(cmd).await,
                LoopEvent::Signal(event) => self.handle_signal(event).await,
                LoopEvent::Engine { call_id, state } => {
                    self.handle_engine_state(call_id, state).await;
                }
                LoopEvent::ChannelStatus(connected) => {
                    self.handle_channel_status(connected).await;
                }
                LoopEvent::RingTimeout { call_id } => self.handle_ring_timeout(call_id).await,
                LoopEvent::ConnectingTimeout { call_id } => {
                    self.handle_connecting_timeout(call_id).await;
                }
                LoopEvent::RecoveryDue {
                    call_id,
                    kind,
                    intent,
                } => self.handle_recovery_due(call_id, kind, intent).await,
                LoopEvent::QualitySample { sample } => self.handle_quality_sample(sample).await,
            }
        }
        // Loop ending must not leak devices
        if let Some(mut session) = self.session.take() {
            session.teardown().await;
        }
        tracing::info!("call controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Initiate {
                receiver_id,
                kind,
                reply,
            } => {
                let _ = reply.send(self.initiate(receiver_id, kind).await);
            }
            Command::Accept { call_id, reply } => {
                let _ = reply.send(self.accept(call_id).await);
            }
            Command::Reject { call_id, reply } => {
                let _ = reply.send(self.reject(call_id).await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(self.toggle_media(true).await);
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_media(false).await);
            }
            Command::ReplaceVideoTrack { device_id, reply } => {
                let _ = reply.send(self.replace_video_track(&device_id).await);
            }
            Command::Shutdown => {}
        }
    }

    #[tracing::instrument(skip(self), fields(receiver = %receiver_id))]
    async fn initiate(&mut self, receiver_id: UserId, kind: CallKind) -> Result<CallId, CallError> {
        if self.store.is_busy() {
            return Err(CallError::Busy);
        }
        let call_id = CallId::random();

        // Media comes first: an acquisition failure aborts the call
        // attempt with no state change
        if let Err(err) = self.establish_session(&call_id, CallRole::Caller, kind).await {
            self.abort_session().await;
            return Err(err);
        }
        if let Err(err) = self
            .channel
            .send(ClientEvent::Initiate {
                call_id: call_id.clone(),
                receiver_id: receiver_id.clone(),
                kind,
                metadata: None,
            })
            .await
        {
            self.abort_session().await;
            return Err(err.into());
        }

        let session = CallSession::new(
            call_id.clone(),
            kind,
            CallState::OutgoingRinging,
            self.config.local_user.clone(),
            receiver_id,
        );
        self.store.set_session(session);
        self.quality.reset();
        self.emit_state(&call_id, CallState::OutgoingRinging);
        self.notifier.play_sound(SoundKind::Ringback, true).await;
        self.arm_ring_timeout(call_id.clone());
        tracing::info!(call_id = %call_id, ?kind, "outgoing call placed");
        Ok(call_id)
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn accept(&mut self, call_id: CallId) -> Result<(), CallError> {
        if self.is_debounced(&call_id) {
            tracing::debug!("accept swallowed by debounce");
            return Ok(());
        }
        let Some(offer) = self.store.take_incoming(&call_id) else {
            return Err(CallError::NotFound(call_id));
        };
        self.record_decision(&call_id);
        self.notifier.stop_sound(SoundKind::Ring).await;
        self.dismiss_incoming_notification().await;

        let session = CallSession::new(
            call_id.clone(),
            offer.kind,
            CallState::Connecting,
            offer.caller.user_id.clone(),
            self.config.local_user.clone(),
        );
        self.store.set_session(session);
        self.emit_state(&call_id, CallState::Connecting);

        self.arm_connecting_timeout(call_id.clone());
        if let Err(err) = self
            .channel
            .send(ClientEvent::Accept {
                call_id: call_id.clone(),
            })
            .await
        {
            // The accept never left; the recovery ladder reconnects and the
            // negotiation timeout reaps the call if it cannot
            self.report_failure(call_id.clone(), err.into()).await;
            return Ok(());
        }

        if let Err(err) = self.establish_session(&call_id, CallRole::Callee, offer.kind).await {
            // Recoverable media failures walk the retry ladder instead of
            // surfacing to the caller of accept(); the peer already got the
            // accept and will start sending its offer
            self.report_failure(call_id.clone(), err).await;
        }
        tracing::info!("incoming call accepted");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    async fn reject(&mut self, call_id: CallId) -> Result<(), CallError> {
        if self.is_debounced(&call_id) {
            tracing::debug!("reject swallowed by debounce");
            return Ok(());
        }
        if self.store.take_incoming(&call_id).is_none() {
            return Err(CallError::NotFound(call_id));
        }
        self.record_decision(&call_id);
        self.notifier.stop_sound(SoundKind::Ring).await;
        let _ = self
            .channel
            .send(ClientEvent::Reject {
                call_id: call_id.clone(),
                reason: None,
            })
            .await;
        self.finish_call(&call_id, CallState::Rejected).await;
        tracing::info!("incoming call rejected");
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(session) = self.store.session() else {
            return Err(CallError::InvalidState {
                state: self.store.call_state(),
            });
        };
        let call_id = session.call_id;
        tracing::info!(call_id = %call_id, "hanging up");
        let _ = self
            .channel
            .send(ClientEvent::End {
                call_id: call_id.clone(),
                reason: None,
            })
            .await;
        self.transition(&call_id, CallState::Ending);
        self.finish_call(&call_id, CallState::Ended).await;
        Ok(())
    }

    async fn toggle_media(&mut self, audio: bool) -> Result<bool, CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidState {
                state: self.store.call_state(),
            });
        };
        let call_id = session.call_id().clone();
        let enabled = if audio {
            session.toggle_audio().await?
        } else {
            session.toggle_video().await?
        };
        let (audio_flag, video_flag) = if audio {
            (Some(enabled), None)
        } else {
            (None, Some(enabled))
        };

        let local = self.config.local_user.clone();
        self.store.update_session(&call_id, |s| {
            s.set_participant_media(&local, audio_flag, video_flag);
        });
        let _ = self
            .channel
            .send(ClientEvent::MediaStatus {
                call_id: call_id.clone(),
                audio: audio_flag,
                video: video_flag,
            })
            .await;
        if let Some(media) = self
            .store
            .session()
            .and_then(|s| s.participants.into_iter().find(|p| p.user_id == local))
            .map(|p| p.media)
        {
            self.emit(CallEvent::MediaStatusChanged {
                call_id,
                user_id: local,
                media,
            });
        }
        Ok(enabled)
    }

    async fn replace_video_track(&mut self, device_id: &str) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidState {
                state: self.store.call_state(),
            });
        };
        session.replace_video_track(device_id).await?;
        Ok(())
    }

    async fn handle_signal(&mut self, event: ServerEvent) {
        if let Some(call_id) = event.call_id() {
            if self.tombstones.contains(call_id) {
                tracing::debug!(
                    call_id = %call_id,
                    event = event.kind_name(),
                    "dropping event for finished call"
                );
                return;
            }
            // Media toggles legitimately repeat byte-identical payloads
            // (mute, unmute, mute again) and applying one twice is
            // idempotent, so they bypass content dedup
            if !matches!(event, ServerEvent::MediaStatus { .. }) {
                let fp = fingerprint(&event);
                if self.seen.check_and_record(call_id, fp) {
                    tracing::debug!(
                        call_id = %call_id,
                        event = event.kind_name(),
                        "dropping redelivered event"
                    );
                    return;
                }
            }
        }

        match event {
            ServerEvent::Incoming {
                call_id,
                call,
                caller,
            } => self.on_incoming(call_id, call.kind, caller).await,
            ServerEvent::Accepted {
                call_id,
                call,
                accepted_by,
                role,
            } => {
                self.on_accepted(call_id, call.caller_id, accepted_by, role)
                    .await;
            }
            ServerEvent::Rejected { call_id, reason, .. } => {
                self.on_rejected(call_id, reason).await;
            }
            ServerEvent::Ended { call_id, .. } => self.on_remote_ended(call_id).await,
            ServerEvent::Error {
                message,
                call_id,
                event,
            } => self.on_server_error(message, call_id, event).await,
            ServerEvent::Offer(envelope) => self.on_remote_offer(envelope).await,
            ServerEvent::Answer(envelope) => self.on_remote_answer(envelope).await,
            ServerEvent::IceCandidate(envelope) => self.on_remote_candidate(envelope).await,
            ServerEvent::MediaStatus {
                call_id,
                user_id,
                audio,
                video,
            } => self.on_remote_media_status(call_id, user_id, audio, video),
        }
    }

    async fn on_incoming(
        &mut self,
        call_id: CallId,
        kind: CallKind,
        caller: crate::types::CallerInfo,
    ) {
        if self.store.is_busy() {
            // Single-call policy: auto-reject while another call occupies
            // the store
            tracing::info!(call_id = %call_id, "busy, auto-rejecting incoming call");
            let _ = self
                .channel
                .send(ClientEvent::Reject {
                    call_id: call_id.clone(),
                    reason: Some("user_busy".to_owned()),
                })
                .await;
            self.tombstone(call_id);
            return;
        }

        let offer = IncomingCallOffer {
            call_id: call_id.clone(),
            caller: caller.clone(),
            kind,
            received_at: Utc::now(),
        };
        self.store.set_incoming(offer.clone());
        self.quality.reset();
        self.incoming_notification = self
            .notifier
            .show_incoming_call(&caller.display_name, &offer)
            .await;
        self.notifier.play_sound(SoundKind::Ring, true).await;
        self.emit(CallEvent::IncomingCall { offer });
        self.emit_state(&call_id, CallState::IncomingRinging);
        self.arm_ring_timeout(call_id.clone());
        tracing::info!(call_id = %call_id, caller = %caller.user_id, "incoming call ringing");
    }

    async fn on_accepted(
        &mut self,
        call_id: CallId,
        caller_id: UserId,
        accepted_by: UserId,
        role: Option<CallRole>,
    ) {
        let Some(session) = self.store.session() else {
            tracing::warn!(call_id = %call_id, "accepted event for unknown call");
            return;
        };
        if session.call_id != call_id {
            tracing::warn!(call_id = %call_id, "accepted event for a different call");
            return;
        }
        if session.state != CallState::OutgoingRinging {
            // A content-different redelivery after we already moved on
            tracing::debug!(call_id = %call_id, state = %session.state, "ignoring late accept");
            return;
        }

        // The server is authoritative about roles when it says so; fall
        // back to comparing against the summary's caller id.
        let resolved = role.unwrap_or_else(|| {
            if caller_id == self.config.local_user {
                CallRole::Caller
            } else {
                CallRole::Callee
            }
        });
        tracing::info!(
            call_id = %call_id,
            accepted_by = %accepted_by,
            role = ?resolved,
            "call accepted"
        );

        self.notifier.stop_sound(SoundKind::Ringback).await;
        self.transition(&call_id, CallState::Connecting);
        self.arm_connecting_timeout(call_id.clone());

        // The session and local media exist since initiate. In the glare
        // case the server resolved us as callee although we also placed a
        // call; rebuild the session with the right role and wait for the
        // remote offer instead of producing our own.
        let session_role = self.session.as_ref().map(RealtimeSession::role);
        if session_role != Some(resolved) {
            self.abort_session().await;
            if let Err(err) = self.establish_session(&call_id, resolved, session.kind).await {
                self.report_failure(call_id.clone(), err).await;
                return;
            }
        }

        if resolved == CallRole::Caller {
            if let Err(err) = self.send_local_offer(&call_id).await {
                self.report_failure(call_id, err).await;
            }
        }
    }

    async fn on_rejected(&mut self, call_id: CallId, reason: Option<String>) {
        if self.store.current_call_id().as_ref() != Some(&call_id) {
            tracing::debug!(call_id = %call_id, "rejected event for unknown call");
            return;
        }
        tracing::info!(call_id = %call_id, ?reason, "call rejected by peer");
        self.notifier.stop_sound(SoundKind::Ringback).await;
        if reason.as_deref() == Some("user_busy") {
            self.notifier.show_status("Call", "The other person is busy").await;
        }
        self.finish_call(&call_id, CallState::Rejected).await;
    }

    async fn on_remote_ended(&mut self, call_id: CallId) {
        if self.store.current_call_id().as_ref() != Some(&call_id) {
            tracing::debug!(call_id = %call_id, "ended event for unknown call");
            return;
        }
        tracing::info!(call_id = %call_id, "call ended by peer");
        self.transition(&call_id, CallState::Ending);
        self.finish_call(&call_id, CallState::Ended).await;
    }

    async fn on_server_error(
        &mut self,
        message: String,
        call_id: Option<CallId>,
        event: Option<String>,
    ) {
        tracing::warn!(?call_id, ?event, %message, "server reported call error");
        let Some(call_id) = call_id else { return };
        if self.store.current_call_id().as_ref() != Some(&call_id) {
            return;
        }
        // Server-side refusals are semantic, not transient; retrying the
        // same request would get the same answer
        self.fail_call(&call_id, CallErrorKind::ServerRejected).await;
    }

    async fn on_remote_offer(&mut self, envelope: SignalEnvelope) {
        let call_id = envelope.call_id.clone();
        let Some(session) = self.session.as_mut() else {
            tracing::warn!(call_id = %call_id, "offer for call without a session");
            return;
        };
        if session.call_id() != &call_id {
            tracing::warn!(call_id = %call_id, "offer for a different call");
            return;
        }
        if session.should_ignore_remote_offer() {
            tracing::info!(call_id = %call_id, "ignoring glare offer, local offer pending");
            return;
        }
        let offer = SessionDescription {
            kind: crate::session::DescriptionKind::Offer,
            data: envelope.data,
        };
        let result = session.accept_offer(offer).await;
        match result {
            Ok(answer) => {
                let remote = self
                    .store
                    .session()
                    .map(|s| s.remote_peer(&self.config.local_user).clone());
                let send = self
                    .channel
                    .send(ClientEvent::Answer(SignalEnvelope {
                        call_id: call_id.clone(),
                        kind: SignalKind::Answer,
                        data: answer.data,
                        target_user_id: remote,
                    }))
                    .await;
                if let Err(err) = send {
                    tracing::warn!(call_id = %call_id, error = %err, "failed to send answer");
                    self.report_failure(call_id, CallError::Signaling(err)).await;
                }
            }
            Err(err) => {
                tracing::warn!(call_id = %call_id, error = %err, "failed to apply remote offer");
                self.report_failure(call_id, CallError::Session(err)).await;
            }
        }
    }

    async fn on_remote_answer(&mut self, envelope: SignalEnvelope) {
        let call_id = envelope.call_id.clone();
        let Some(session) = self.session.as_mut() else {
            tracing::warn!(call_id = %call_id, "answer for call without a session");
            return;
        };
        if session.call_id() != &call_id {
            tracing::warn!(call_id = %call_id, "answer for a different call");
            return;
        }
        let answer = SessionDescription {
            kind: crate::session::DescriptionKind::Answer,
            data: envelope.data,
        };
        if let Err(err) = session.apply_answer(answer).await {
            tracing::warn!(call_id = %call_id, error = %err, "failed to apply remote answer");
            self.report_failure(call_id, CallError::Session(err)).await;
        }
    }

    async fn on_remote_candidate(&mut self, envelope: SignalEnvelope) {
        let call_id = envelope.call_id.clone();
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(call_id = %call_id, "candidate for call without a session");
            return;
        };
        if session.call_id() != &call_id {
            return;
        }
        let candidate = RemoteCandidate {
            data: envelope.data,
        };
        if let Err(err) = session.apply_remote_candidate(candidate).await {
            // A single bad candidate is not fatal; connectivity can still
            // establish over the remaining ones
            tracing::warn!(call_id = %call_id, error = %err, "failed to apply candidate");
        }
    }

    fn on_remote_media_status(
        &mut self,
        call_id: CallId,
        user_id: UserId,
        audio: Option<bool>,
        video: Option<bool>,
    ) {
        let updated = self.store.update_session(&call_id, |s| {
            s.set_participant_media(&user_id, audio, video);
        });
        if !updated {
            return;
        }
        if let Some(media) = self
            .store
            .session()
            .and_then(|s| s.participants.into_iter().find(|p| p.user_id == user_id))
            .map(|p| p.media)
        {
            self.emit(CallEvent::MediaStatusChanged {
                call_id,
                user_id,
                media,
            });
        }
    }

    async fn handle_engine_state(&mut self, call_id: CallId, state: EngineConnectionState) {
        if self.session.as_ref().map(RealtimeSession::call_id) != Some(&call_id) {
            return;
        }
        tracing::debug!(call_id = %call_id, ?state, "engine connection state");
        match state {
            EngineConnectionState::Connected => {
                let current = self.store.call_state();
                if current == CallState::Connecting {
                    self.store.update_session(&call_id, |s| {
                        s.connected_at = Some(Utc::now());
                        s.is_connected = true;
                    });
                    self.notifier.stop_sound(SoundKind::Ringback).await;
                    self.transition(&call_id, CallState::Active);
                    tracing::info!(call_id = %call_id, "call active");
                } else {
                    self.store.update_session(&call_id, |s| {
                        s.is_connected = true;
                    });
                }
                if let Some(stream) = self.session.as_ref().and_then(RealtimeSession::remote_stream)
                {
                    self.store.set_remote_stream(Some(stream.clone()));
                    self.emit(CallEvent::RemoteStreamReady { call_id: call_id.clone(), stream });
                }
                for kind in [
                    CallErrorKind::IceConnectionFailed,
                    CallErrorKind::OfferAnswerFailed,
                ] {
                    self.recovery.record_success(&call_id, kind);
                }
            }
            EngineConnectionState::Disconnected | EngineConnectionState::Failed => {
                self.store.update_session(&call_id, |s| {
                    s.is_connected = false;
                });
                self.handle_failure(call_id, CallErrorKind::IceConnectionFailed)
                    .await;
            }
            EngineConnectionState::Connecting => {}
        }
    }

    async fn handle_channel_status(&mut self, connected: bool) {
        self.store.set_signaling_connected(connected);
        self.emit(CallEvent::SignalingConnection { connected });
        let Some(call_id) = self.store.current_call_id() else {
            return;
        };
        if connected {
            for kind in [
                CallErrorKind::ConnectionLost,
                CallErrorKind::SignalingError,
                CallErrorKind::NetworkTimeout,
            ] {
                self.recovery.record_success(&call_id, kind);
            }
        } else {
            self.handle_failure(call_id, CallErrorKind::ConnectionLost).await;
        }
    }

    /// Ring timeout covers both directions: an unanswered incoming call is
    /// missed, and an unanswered outgoing call is abandoned on the same
    /// clock rather than ringing the peer forever.
    async fn handle_ring_timeout(&mut self, call_id: CallId) {
        match self.store.call_state() {
            CallState::OutgoingRinging
                if self.store.current_call_id().as_ref() == Some(&call_id) =>
            {
                tracing::info!(call_id = %call_id, "outgoing call unanswered");
                self.notifier.stop_sound(SoundKind::Ringback).await;
                let _ = self
                    .channel
                    .send(ClientEvent::End {
                        call_id: call_id.clone(),
                        reason: Some("timeout".to_owned()),
                    })
                    .await;
                self.finish_call(&call_id, CallState::Rejected).await;
            }
            CallState::IncomingRinging
                if self.store.current_call_id().as_ref() == Some(&call_id) =>
            {
                tracing::info!(call_id = %call_id, "incoming call missed");
                self.notifier.stop_sound(SoundKind::Ring).await;
                self.store.take_incoming(&call_id);
                self.finish_call(&call_id, CallState::Rejected).await;
            }
            _ => {}
        }
    }

    async fn handle_connecting_timeout(&mut self, call_id: CallId) {
        if self.store.call_state() == CallState::Connecting
            && self.store.current_call_id().as_ref() == Some(&call_id)
        {
            tracing::warn!(call_id = %call_id, "negotiation timed out");
            self.fail_call(&call_id, CallErrorKind::SetupTimeout).await;
        }
    }

    async fn handle_recovery_due(
        &mut self,
        call_id: CallId,
        kind: CallErrorKind,
        intent: RecoveryIntent,
    ) {
        if self.tombstones.contains(&call_id)
            || self.store.current_call_id().as_ref() != Some(&call_id)
        {
            return;
        }
        tracing::info!(call_id = %call_id, ?kind, ?intent, "executing recovery");
        match intent {
            RecoveryIntent::ReconnectSignaling => {
                if self.channel.is_connected() {
                    // The channel recovered on its own (or the loss was
                    // synthesized from quality samples); count it recovered
                    self.recovery.record_success(&call_id, kind);
                } else {
                    // Success is observed through the channel status watch
                    self.channel.request_reconnect();
                }
            }
            RecoveryIntent::IceRestart => {
                let result = match self.session.as_mut() {
                    Some(session) => session.restart_ice().await,
                    None => return,
                };
                if result.is_err() {
                    self.handle_failure(call_id, kind).await;
                }
                // Success is observed through the engine state watch
            }
            RecoveryIntent::RetryMediaAcquisition => {
                let kind_of_call = match self.store.session() {
                    Some(s) => s.kind,
                    None => return,
                };
                let constraints = match kind_of_call {
                    CallKind::Voice => MediaConstraints::voice(),
                    CallKind::Video => MediaConstraints::video_call(),
                };
                let result = match self.session.as_mut() {
                    Some(session) => session.acquire_local_media(&constraints).await,
                    None => return,
                };
                match result {
                    Ok(stream) => {
                        self.store.set_local_stream(Some(stream));
                        self.recovery.record_success(&call_id, kind);
                        tracing::info!(call_id = %call_id, "media re-acquired");
                        // A caller stalled before its offer resumes the
                        // negotiation flow here
                        let needs_offer = self.session.as_ref().is_some_and(|s| {
                            s.role() == CallRole::Caller && !s.has_local_offer()
                        });
                        if needs_offer {
                            if let Err(err) = self.send_local_offer(&call_id).await {
                                self.report_failure(call_id, err).await;
                            }
                        }
                    }
                    Err(_) => self.handle_failure(call_id, kind).await,
                }
            }
        }
    }

    async fn handle_quality_sample(&mut self, sample: ConnectionQualitySample) {
        if self.store.call_state() != CallState::Active {
            return;
        }
        let Some(call_id) = self.store.current_call_id() else {
            return;
        };
        let observation = self.quality.observe(&sample);
        self.store.set_quality(Some(observation.level));
        if observation.level_changed {
            self.emit(CallEvent::QualityChanged {
                call_id: call_id.clone(),
                level: observation.level,
            });
        }
        if observation.connection_degraded {
            // Sustained poor quality is treated as a lost connection even
            // without an explicit transport disconnect
            self.handle_failure(call_id, CallErrorKind::ConnectionLost).await;
        }
    }

    /// Create the realtime session and acquire local media
    async fn establish_session(
        &mut self,
        call_id: &CallId,
        role: CallRole,
        kind: CallKind,
    ) -> Result<(), CallError> {
        let engine = self.engines.create_engine(call_id)?;

        let mut states = engine.connection_states();
        let engine_tx = self.tx.clone();
        let engine_call = call_id.clone();
        tokio::spawn(async move {
            while let Ok(state) = states.recv().await {
                if engine_tx
                    .send(LoopEvent::Engine {
                        call_id: engine_call.clone(),
                        state,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Install the session before acquiring media so a recoverable
        // acquisition failure leaves something for the retry to act on
        self.session = Some(RealtimeSession::new(
            call_id.clone(),
            role,
            engine,
            self.devices.clone(),
        ));
        let constraints = match kind {
            CallKind::Voice => MediaConstraints::voice(),
            CallKind::Video => MediaConstraints::video_call(),
        };
        let result = match self.session.as_mut() {
            Some(session) => session.acquire_local_media(&constraints).await,
            None => return Ok(()),
        };
        let stream = result?;
        self.store.set_local_stream(Some(stream));
        Ok(())
    }

    /// Dismiss the incoming-call banner, if the notifier showed one
    async fn dismiss_incoming_notification(&mut self) {
        if let Some(id) = self.incoming_notification.take() {
            self.notifier.dismiss_notification(&id).await;
        }
    }

    /// Tear down a partially established session without touching call
    /// state
    async fn abort_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.teardown().await;
        }
        self.store.set_local_stream(None);
    }

    /// Create and send our negotiation offer (caller role)
    async fn send_local_offer(&mut self, call_id: &CallId) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidState {
                state: self.store.call_state(),
            });
        };
        let offer = session.create_offer().await?;
        let remote = self
            .store
            .session()
            .map(|s| s.remote_peer(&self.config.local_user).clone());
        self.channel
            .send(ClientEvent::Offer(SignalEnvelope {
                call_id: call_id.clone(),
                kind: SignalKind::Offer,
                data: offer.data,
                target_user_id: remote,
            }))
            .await?;
        Ok(())
    }

    /// Route a command-path error into the recovery machinery
    async fn report_failure(&mut self, call_id: CallId, err: CallError) {
        let kind = match &err {
            CallError::Media(e) => map_media_error(e),
            CallError::Session(SessionError::Media(e)) => map_media_error(e),
            CallError::Session(_) => CallErrorKind::OfferAnswerFailed,
            CallError::Signaling(_) => CallErrorKind::SignalingError,
            _ => CallErrorKind::Internal,
        };
        tracing::warn!(call_id = %call_id, error = %err, ?kind, "call operation failed");
        self.handle_failure(call_id, kind).await;
    }

    /// Ask the recovery manager what to do and either schedule the retry
    /// or fail the call
    async fn handle_failure(&mut self, call_id: CallId, kind: CallErrorKind) {
        if self.tombstones.contains(&call_id) {
            return;
        }
        match self.recovery.report(&call_id, kind) {
            RecoveryDecision::Retry {
                intent,
                delay,
                attempt: _,
            } => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(LoopEvent::RecoveryDue {
                            call_id,
                            kind,
                            intent,
                        })
                        .await;
                });
            }
            RecoveryDecision::Fatal => self.fail_call(&call_id, kind).await,
        }
    }

    /// Move the current call to `Failed` and clean up
    async fn fail_call(&mut self, call_id: &CallId, kind: CallErrorKind) {
        tracing::warn!(call_id = %call_id, ?kind, "call failed");
        self.emit(CallEvent::CallFailed {
            call_id: call_id.clone(),
            kind,
        });
        self.notifier.show_status("Call failed", kind.describe()).await;
        self.finish_call(call_id, CallState::Failed).await;
    }

    /// Common terminal path: transition, tear down, purge, tombstone.
    ///
    /// Every terminal transition funnels through here so devices are
    /// released and counters purged on every exit, not just the happy one.
    async fn finish_call(&mut self, call_id: &CallId, terminal: CallState) {
        debug_assert!(terminal.is_terminal());
        self.notifier.stop_sound(SoundKind::Ring).await;
        self.notifier.stop_sound(SoundKind::Ringback).await;
        self.dismiss_incoming_notification().await;
        let had_session = self
            .store
            .session()
            .is_some_and(|s| &s.call_id == call_id);
        let applied = self.transition(call_id, terminal);
        if !had_session && !applied {
            // Ringing incoming calls have no session yet; still announce
            // the terminal state
            self.emit_state(call_id, terminal);
        }
        if terminal == CallState::Ended {
            self.notifier.play_sound(SoundKind::End, false).await;
        }

        if let Some(mut session) = self.session.take() {
            if session.call_id() == call_id {
                session.teardown().await;
            } else {
                // Not ours; put it back
                self.session = Some(session);
            }
        }
        self.recovery.purge_call(call_id);
        self.quality.reset();
        self.seen.forget(call_id);
        self.tombstone(call_id.clone());
        self.store.clear_call();
    }

    /// Validated state transition on the stored session; returns whether
    /// the transition applied
    fn transition(&mut self, call_id: &CallId, to: CallState) -> bool {
        let mut applied = false;
        self.store.update_session(call_id, |s| {
            if CallState::can_transition(s.state, to) {
                s.state = to;
                applied = true;
            } else {
                tracing::warn!(
                    call_id = %s.call_id,
                    from = %s.state,
                    to = %to,
                    "illegal state transition refused"
                );
            }
        });
        if applied {
            self.emit_state(call_id, to);
        }
        applied
    }

    fn emit_state(&self, call_id: &CallId, state: CallState) {
        self.emit(CallEvent::StateChanged {
            call_id: call_id.clone(),
            state,
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn tombstone(&mut self, call_id: CallId) {
        if self.tombstones.insert(call_id.clone()) {
            self.tombstone_order.push_back(call_id);
            while self.tombstone_order.len() > self.config.max_tombstones {
                if let Some(old) = self.tombstone_order.pop_front() {
                    self.tombstones.remove(&old);
                }
            }
        }
    }

    fn is_debounced(&self, call_id: &CallId) -> bool {
        self.last_decision
            .as_ref()
            .is_some_and(|(id, at)| {
                id == call_id && at.elapsed() < self.config.decision_debounce
            })
    }

    fn record_decision(&mut self, call_id: &CallId) {
        self.last_decision = Some((call_id.clone(), Instant::now()));
    }

    fn arm_ring_timeout(&self, call_id: CallId) {
        let tx = self.tx.clone();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(LoopEvent::RingTimeout { call_id }).await;
        });
    }

    fn arm_connecting_timeout(&self, call_id: CallId) {
        let tx = self.tx.clone();
        let timeout = self.config.connecting_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(LoopEvent::ConnectingTimeout { call_id }).await;
        });
    }
}
