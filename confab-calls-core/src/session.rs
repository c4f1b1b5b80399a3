//! Realtime session adapter.
//!
//! Wraps local media acquisition and the peer-to-peer negotiation engine
//! for a single call. The engine itself (SDP generation, ICE, media
//! encoding) lives behind the [`NegotiationEngine`] seam and is supplied by
//! the host application; this module owns the call-scoped policy around it:
//! candidate buffering before the remote description, atomic video-track
//! replacement, and exactly-once teardown of local devices.

use crate::types::{CallId, CallRole};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Why local media acquisition failed.
///
/// Permission denial and missing devices are fatal for the current call
/// attempt; a busy device is retryable after a short delay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    /// User denied camera/microphone permission
    #[error("media permission denied")]
    PermissionDenied,

    /// No matching capture device exists
    #[error("capture device not found")]
    DeviceNotFound,

    /// Device is held by another application
    #[error("capture device busy")]
    DeviceBusy,

    /// Anything else
    #[error("media acquisition failed: {0}")]
    Unknown(String),
}

/// Realtime session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    /// The negotiation engine reported a failure
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Operation is not valid for the session's current state
    #[error("invalid session operation: {0}")]
    InvalidState(&'static str),

    /// The session has been torn down
    #[error("session closed")]
    Closed,
}

/// Requested local media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio
    pub audio: bool,
    /// Capture camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only constraints
    #[must_use]
    pub fn voice() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Audio and video constraints
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Handle to a single local media track.
///
/// Opaque to this crate: only the id is ever inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackHandle {
    /// Engine-assigned track id
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Opaque handle to a media stream (local or remote)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStreamHandle {
    /// Engine-assigned stream id
    pub id: String,
}

/// Locally captured media for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    /// The stream handle holding the tracks
    pub stream: MediaStreamHandle,
    /// Microphone track, if captured
    pub audio_track: Option<TrackHandle>,
    /// Camera track, if captured
    pub video_track: Option<TrackHandle>,
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    /// Negotiation offer
    Offer,
    /// Negotiation answer
    Answer,
}

/// Engine-opaque session description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: DescriptionKind,
    /// Opaque payload
    pub data: serde_json::Value,
}

/// Engine-opaque remote connectivity candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCandidate {
    /// Opaque payload
    pub data: serde_json::Value,
}

/// Negotiation signaling state, mirroring the engine's view.
///
/// Used by the controller's glare guard: an incoming offer is ignored when
/// the local side already created one and negotiation is not `Stable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No outstanding offer on either side
    Stable,
    /// Local offer created, awaiting remote answer
    HaveLocalOffer,
    /// Remote offer applied, local answer pending
    HaveRemoteOffer,
}

/// Media-path connection state surfaced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineConnectionState {
    /// Connectivity checks in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Gave up
    Failed,
}

/// Device access seam
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire local capture devices for the given constraints
    async fn acquire(&self, constraints: &MediaConstraints)
        -> Result<LocalMedia, MediaAcquisitionError>;

    /// Acquire a video track from a specific capture device
    async fn acquire_video_track(&self, device_id: &str)
        -> Result<TrackHandle, MediaAcquisitionError>;

    /// Stop a single track
    async fn stop_track(&self, track: &TrackHandle);

    /// Stop every track of the given media
    async fn release(&self, media: &LocalMedia);
}

/// Negotiation engine seam.
///
/// One engine instance per call. The engine owns the actual peer
/// connection; this crate only drives it and routes its artifacts over the
/// signaling channel.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Attach local media before negotiating
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), SessionError>;

    /// Create a negotiation offer (caller role)
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    /// Apply a remote offer and produce the answer (callee role)
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError>;

    /// Apply the remote answer to a previously created offer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), SessionError>;

    /// Apply a remote connectivity candidate
    async fn apply_remote_candidate(&self, candidate: RemoteCandidate)
        -> Result<(), SessionError>;

    /// Swap the outgoing video track without renegotiation
    async fn replace_video_track(&self, track: &TrackHandle) -> Result<(), SessionError>;

    /// Enable or disable an outgoing track
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), SessionError>;

    /// Restart connectivity checks on the existing session
    async fn restart_ice(&self) -> Result<(), SessionError>;

    /// Current negotiation signaling state
    fn negotiation_state(&self) -> NegotiationState;

    /// Remote stream handle, once media arrived
    fn remote_stream(&self) -> Option<MediaStreamHandle>;

    /// Subscribe to media-path connection state changes
    fn connection_states(&self) -> broadcast::Receiver<EngineConnectionState>;

    /// Close the peer connection
    async fn close(&self);
}

/// Creates one engine per call attempt
pub trait EngineFactory: Send + Sync {
    /// Build a fresh engine for the given call
    fn create_engine(&self, call_id: &CallId) -> Result<Arc<dyn NegotiationEngine>, SessionError>;
}

/// Per-call realtime session.
///
/// Created when a call leaves the ringing phase and destroyed on any
/// terminal transition. Holds the local devices on behalf of the single
/// active call; [`RealtimeSession::teardown`] releases them exactly once
/// no matter how many terminal paths race to it.
pub struct RealtimeSession {
    call_id: CallId,
    role: CallRole,
    engine: Arc<dyn NegotiationEngine>,
    devices: Arc<dyn MediaDevices>,
    local_media: Option<LocalMedia>,
    pending_candidates: Vec<RemoteCandidate>,
    remote_description_set: bool,
    local_offer_created: bool,
    audio_enabled: bool,
    video_enabled: bool,
    released: bool,
}

impl RealtimeSession {
    /// Create a session for the given call and role
    #[must_use]
    pub fn new(
        call_id: CallId,
        role: CallRole,
        engine: Arc<dyn NegotiationEngine>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            call_id,
            role,
            engine,
            devices,
            local_media: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            local_offer_created: false,
            audio_enabled: false,
            video_enabled: false,
            released: false,
        }
    }

    /// The call this session belongs to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Local role in the call
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Whether the local side already created an offer
    #[must_use]
    pub fn has_local_offer(&self) -> bool {
        self.local_offer_created
    }

    /// Whether a remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates buffered while waiting for the remote description
    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Local stream handle, once media was acquired
    #[must_use]
    pub fn local_stream(&self) -> Option<&MediaStreamHandle> {
        self.local_media.as_ref().map(|m| &m.stream)
    }

    /// Remote stream handle, once media arrived
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.engine.remote_stream()
    }

    /// Whether local audio is currently enabled
    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    /// Whether local video is currently enabled
    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Whether teardown already ran
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Acquire local media and attach it to the engine
    ///
    /// # Errors
    ///
    /// Returns a discriminated [`MediaAcquisitionError`] (wrapped) if the
    /// devices cannot be acquired, or a negotiation error if attaching
    /// fails.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn acquire_local_media(
        &mut self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStreamHandle, SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        let media = self.devices.acquire(constraints).await?;
        self.engine.attach_media(&media).await?;
        self.audio_enabled = media.audio_track.is_some();
        self.video_enabled = media.video_track.is_some();
        let stream = media.stream.clone();
        self.local_media = Some(media);
        tracing::debug!(stream_id = %stream.id, "local media acquired");
        Ok(stream)
    }

    /// Create the negotiation offer. Caller role only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for the callee role, or the engine's error.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn create_offer(&mut self) -> Result<SessionDescription, SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        if self.role != CallRole::Caller {
            return Err(SessionError::InvalidState("only the caller creates offers"));
        }
        let offer = self.engine.create_offer().await?;
        self.local_offer_created = true;
        tracing::debug!("negotiation offer created");
        Ok(offer)
    }

    /// Whether an incoming remote offer should be treated as a duplicate.
    ///
    /// True when the local side already created an offer and negotiation
    /// has left the stable state; restarting negotiation for such an offer
    /// would loop.
    #[must_use]
    pub fn should_ignore_remote_offer(&self) -> bool {
        self.local_offer_created && self.engine.negotiation_state() != NegotiationState::Stable
    }

    /// Apply a remote offer and produce the answer. Callee role only.
    ///
    /// Applying the offer sets the remote description, so any buffered
    /// candidates are flushed afterwards.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for the caller role, or the engine's error.
    #[tracing::instrument(skip(self, offer), fields(call_id = %self.call_id))]
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        if self.role != CallRole::Callee {
            return Err(SessionError::InvalidState("only the callee answers offers"));
        }
        let answer = self.engine.accept_offer(offer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await?;
        tracing::debug!("remote offer applied, answer created");
        Ok(answer)
    }

    /// Apply the remote answer to our offer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no offer was created for this call, or
    /// the engine's error.
    #[tracing::instrument(skip(self, answer), fields(call_id = %self.call_id))]
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        if !self.local_offer_created {
            return Err(SessionError::InvalidState("answer received before offer was sent"));
        }
        self.engine.apply_answer(answer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await?;
        tracing::debug!("remote answer applied");
        Ok(())
    }

    /// Apply a remote candidate, buffering it if the remote description is
    /// not set yet. Buffered candidates are never dropped; they are
    /// flushed as soon as the remote description is applied.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if immediate application fails.
    pub async fn apply_remote_candidate(
        &mut self,
        candidate: RemoteCandidate,
    ) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        if !self.remote_description_set {
            tracing::trace!(call_id = %self.call_id, "buffering early candidate");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.engine.apply_remote_candidate(candidate).await
    }

    async fn flush_pending_candidates(&mut self) -> Result<(), SessionError> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        tracing::debug!(
            call_id = %self.call_id,
            count = pending.len(),
            "flushing buffered candidates"
        );
        for candidate in pending {
            self.engine.apply_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Swap the outgoing camera track atomically: the new track is
    /// acquired and confirmed attached before the old one is stopped, so
    /// there is never a window with zero active tracks.
    ///
    /// # Errors
    ///
    /// Returns an acquisition or engine error; the old track keeps
    /// running on failure.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id, device_id))]
    pub async fn replace_video_track(&mut self, device_id: &str) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        let media = self
            .local_media
            .as_mut()
            .ok_or(SessionError::InvalidState("no local media acquired"))?;
        let new_track = self.devices.acquire_video_track(device_id).await?;
        self.engine.replace_video_track(&new_track).await?;
        let old = media.video_track.replace(new_track);
        if let Some(old) = old {
            self.devices.stop_track(&old).await;
        }
        tracing::info!("video track replaced");
        Ok(())
    }

    /// Toggle the microphone; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the track cannot be toggled.
    pub async fn toggle_audio(&mut self) -> Result<bool, SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        let enabled = !self.audio_enabled;
        self.engine.set_track_enabled(TrackKind::Audio, enabled).await?;
        self.audio_enabled = enabled;
        Ok(enabled)
    }

    /// Toggle the camera; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the track cannot be toggled.
    pub async fn toggle_video(&mut self) -> Result<bool, SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        let enabled = !self.video_enabled;
        self.engine.set_track_enabled(TrackKind::Video, enabled).await?;
        self.video_enabled = enabled;
        Ok(enabled)
    }

    /// Restart connectivity checks on the existing session
    ///
    /// # Errors
    ///
    /// Returns the engine's error.
    pub async fn restart_ice(&self) -> Result<(), SessionError> {
        if self.released {
            return Err(SessionError::Closed);
        }
        self.engine.restart_ice().await
    }

    /// Subscribe to the engine's connection state changes
    #[must_use]
    pub fn connection_states(&self) -> broadcast::Receiver<EngineConnectionState> {
        self.engine.connection_states()
    }

    /// Close the engine and release local devices.
    ///
    /// Idempotent: devices are stopped exactly once regardless of which
    /// terminal path gets here first.
    #[tracing::instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pending_candidates.clear();
        self.engine.close().await;
        if let Some(media) = self.local_media.take() {
            self.devices.release(&media).await;
        }
        tracing::debug!("session torn down, devices released");
    }
}
