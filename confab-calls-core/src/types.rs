//! Core call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a single call attempt.
///
/// Call ids are opaque strings: locally initiated calls mint a UUID-backed
/// id, but ids received over the signaling channel are taken as-is. The id
/// is the sole join key between the signaling channel, the realtime session
/// adapter, the recovery manager and the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Mint a new random call ID for a locally initiated call
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque user identifier as carried by signaling payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of call being placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Audio-only call
    Voice,
    /// Audio and video call
    Video,
}

/// Call state enumeration
///
/// The lifecycle is `Idle -> OutgoingRinging -> Connecting -> Active ->
/// Ending -> Ended` for the caller and `Idle -> IncomingRinging ->
/// Connecting -> ...` for the callee. Any non-terminal state may move
/// directly to `Failed` or `Rejected`. Terminal states are final: no event
/// may resurrect a call that reached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No active call
    Idle,
    /// Local user placed a call, waiting for the remote peer
    OutgoingRinging,
    /// Remote peer is calling, waiting for a local decision
    IncomingRinging,
    /// Accepted on both ends, negotiation in progress
    Connecting,
    /// Media is flowing
    Active,
    /// Teardown in progress
    Ending,
    /// Call completed normally (terminal)
    Ended,
    /// Call failed (terminal)
    Failed,
    /// Call was rejected or timed out unanswered (terminal)
    Rejected,
}

impl CallState {
    /// Whether this state is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed | Self::Rejected)
    }

    /// Check whether a state transition is legal
    #[must_use]
    pub fn can_transition(from: CallState, to: CallState) -> bool {
        if from.is_terminal() {
            return false;
        }
        // Failure and rejection are reachable from every non-terminal state
        if to == CallState::Failed {
            return true;
        }
        matches!(
            (from, to),
            (CallState::Idle, CallState::OutgoingRinging)
                | (CallState::Idle, CallState::IncomingRinging)
                | (CallState::OutgoingRinging, CallState::Connecting)
                | (CallState::OutgoingRinging, CallState::Ending)
                | (CallState::OutgoingRinging, CallState::Rejected)
                | (CallState::IncomingRinging, CallState::Connecting)
                | (CallState::IncomingRinging, CallState::Ending)
                | (CallState::IncomingRinging, CallState::Rejected)
                | (CallState::Connecting, CallState::Active)
                | (CallState::Connecting, CallState::Ending)
                | (CallState::Connecting, CallState::Rejected)
                | (CallState::Active, CallState::Ending)
                | (CallState::Ending, CallState::Ended)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::OutgoingRinging => "outgoing_ringing",
            Self::IncomingRinging => "incoming_ringing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ending => "ending",
            Self::Ended => "ended",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Which side of the call the local user is on.
///
/// Only the caller produces the negotiation offer after acceptance; the
/// callee only ever responds. Resolving this explicitly (rather than from
/// event arrival order) is what prevents offer glare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Local user originated the call
    Caller,
    /// Local user received the call
    Callee,
}

/// Per-participant media flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatus {
    /// Microphone track enabled
    pub audio_enabled: bool,
    /// Camera track enabled
    pub video_enabled: bool,
}

impl MediaStatus {
    /// Initial media status for a call of the given kind
    #[must_use]
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            audio_enabled: true,
            video_enabled: kind == CallKind::Video,
        }
    }
}

/// A participant in a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// User identifier
    pub user_id: UserId,
    /// Current media flags, mutated by remote media-status events
    pub media: MediaStatus,
}

/// The single active call session.
///
/// Owned exclusively by the controller and written only through its
/// transition functions; removed from the store on terminal transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Voice or video
    pub kind: CallKind,
    /// Current state
    pub state: CallState,
    /// Originating user
    pub caller_id: UserId,
    /// Receiving user
    pub receiver_id: UserId,
    /// Participants and their media flags
    pub participants: Vec<Participant>,
    /// When the session was created locally
    pub started_at: DateTime<Utc>,
    /// When the media path connected
    pub connected_at: Option<DateTime<Utc>>,
    /// Whether the media path is currently connected
    pub is_connected: bool,
}

impl CallSession {
    /// Create a session in the given initial state
    #[must_use]
    pub fn new(
        call_id: CallId,
        kind: CallKind,
        state: CallState,
        caller_id: UserId,
        receiver_id: UserId,
    ) -> Self {
        let participants = vec![
            Participant {
                user_id: caller_id.clone(),
                media: MediaStatus::for_kind(kind),
            },
            Participant {
                user_id: receiver_id.clone(),
                media: MediaStatus::for_kind(kind),
            },
        ];
        Self {
            call_id,
            kind,
            state,
            caller_id,
            receiver_id,
            participants,
            started_at: Utc::now(),
            connected_at: None,
            is_connected: false,
        }
    }

    /// Seconds since the media path connected, zero if it never did
    #[must_use]
    pub fn duration_seconds(&self) -> u64 {
        self.connected_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// The remote peer from the perspective of `local`
    #[must_use]
    pub fn remote_peer(&self, local: &UserId) -> &UserId {
        if &self.caller_id == local {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    /// Update a participant's media flags
    pub fn set_participant_media(
        &mut self,
        user_id: &UserId,
        audio: Option<bool>,
        video: Option<bool>,
    ) {
        if let Some(p) = self.participants.iter_mut().find(|p| &p.user_id == user_id) {
            if let Some(a) = audio {
                p.media.audio_enabled = a;
            }
            if let Some(v) = video {
                p.media.video_enabled = v;
            }
        }
    }
}

/// Display information about the remote caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    /// Caller user id
    pub user_id: UserId,
    /// Human-readable name
    pub display_name: String,
    /// Optional avatar URL
    pub avatar_url: Option<String>,
}

/// A pending incoming call, present only while the call is ringing.
///
/// Superseded by a [`CallSession`] once accepted, dropped on rejection or
/// the unanswered-ring timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCallOffer {
    /// Call identifier
    pub call_id: CallId,
    /// Who is calling
    pub caller: CallerInfo,
    /// Voice or video
    pub kind: CallKind,
    /// When the offer arrived locally
    pub received_at: DateTime<Utc>,
}

/// Kind of negotiation artifact carried by a [`SignalEnvelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Negotiation offer
    Offer,
    /// Negotiation answer
    Answer,
    /// Connectivity candidate
    IceCandidate,
}

/// Routed negotiation payload.
///
/// Transient: envelopes are routed between the signaling channel and the
/// realtime session adapter and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Call this envelope belongs to
    pub call_id: CallId,
    /// Offer, answer or candidate
    pub kind: SignalKind,
    /// Engine-opaque payload (SDP, candidate line, ...)
    pub data: serde_json::Value,
    /// Optional explicit routing target
    pub target_user_id: Option<UserId>,
}

/// Summary of a call as carried inside lifecycle signaling payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Call identifier
    pub call_id: CallId,
    /// Voice or video
    pub kind: CallKind,
    /// Originating user
    pub caller_id: UserId,
    /// Receiving user
    pub receiver_id: UserId,
}

/// Coarse connection quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// No connectivity observed
    Disconnected,
    /// Persistent trouble
    Poor,
    /// Usable but degraded
    Fair,
    /// Healthy
    Good,
    /// Headroom to spare
    Excellent,
}

/// A periodic connection-quality measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQualitySample {
    /// Classified level
    pub level: QualityLevel,
    /// Round-trip time in milliseconds
    pub round_trip_time_ms: u32,
    /// Packets lost in the sampling window
    pub packets_lost: u32,
    /// Jitter in milliseconds
    pub jitter_ms: u32,
}

impl ConnectionQualitySample {
    /// Classify raw measurements into a quality level
    #[must_use]
    pub fn classify(round_trip_time_ms: u32, packets_lost: u32, jitter_ms: u32) -> QualityLevel {
        if round_trip_time_ms == 0 && packets_lost > 0 {
            return QualityLevel::Disconnected;
        }
        if round_trip_time_ms > 400 || packets_lost > 25 || jitter_ms > 80 {
            QualityLevel::Poor
        } else if round_trip_time_ms > 200 || packets_lost > 8 || jitter_ms > 40 {
            QualityLevel::Fair
        } else if round_trip_time_ms > 100 || packets_lost > 2 || jitter_ms > 20 {
            QualityLevel::Good
        } else {
            QualityLevel::Excellent
        }
    }

    /// Build a sample from raw measurements
    #[must_use]
    pub fn from_measurements(round_trip_time_ms: u32, packets_lost: u32, jitter_ms: u32) -> Self {
        Self {
            level: Self::classify(round_trip_time_ms, packets_lost, jitter_ms),
            round_trip_time_ms,
            packets_lost,
            jitter_ms,
        }
    }
}

/// Outcome recorded in call history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    /// Completed normally
    Completed,
    /// Rejected or unanswered
    Rejected,
    /// Missed by the local user
    Missed,
    /// Failed due to an error
    Failed,
}

/// A historical call record, fetched from the history collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Call identifier
    pub call_id: CallId,
    /// The remote peer
    pub peer: UserId,
    /// Voice or video
    pub kind: CallKind,
    /// How the call ended
    pub outcome: CallOutcome,
    /// When the call started
    pub started_at: DateTime<Utc>,
    /// Connected duration in seconds
    pub duration_seconds: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_random_is_unique() {
        assert_ne!(CallId::random(), CallId::random());
    }

    #[test]
    fn test_terminal_states() {
        assert!(CallState::Ended.is_terminal());
        assert!(CallState::Failed.is_terminal());
        assert!(CallState::Rejected.is_terminal());
        assert!(!CallState::Active.is_terminal());
        assert!(!CallState::Connecting.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        use CallState::*;
        assert!(CallState::can_transition(Idle, OutgoingRinging));
        assert!(CallState::can_transition(Idle, IncomingRinging));
        assert!(CallState::can_transition(OutgoingRinging, Connecting));
        assert!(CallState::can_transition(IncomingRinging, Connecting));
        assert!(CallState::can_transition(Connecting, Active));
        assert!(CallState::can_transition(Active, Ending));
        assert!(CallState::can_transition(Ending, Ended));
        assert!(CallState::can_transition(OutgoingRinging, Rejected));
        assert!(CallState::can_transition(IncomingRinging, Rejected));

        // Failure is reachable from anywhere non-terminal
        assert!(CallState::can_transition(Idle, Failed));
        assert!(CallState::can_transition(Active, Failed));
        assert!(CallState::can_transition(Ending, Failed));
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        use CallState::*;
        for terminal in [Ended, Failed, Rejected] {
            for to in [
                Idle,
                OutgoingRinging,
                IncomingRinging,
                Connecting,
                Active,
                Ending,
                Ended,
                Failed,
                Rejected,
            ] {
                assert!(
                    !CallState::can_transition(terminal, to),
                    "{terminal} -> {to} must be illegal"
                );
            }
        }
    }

    #[test]
    fn test_invalid_forward_jumps() {
        use CallState::*;
        assert!(!CallState::can_transition(Idle, Active));
        assert!(!CallState::can_transition(OutgoingRinging, Active));
        assert!(!CallState::can_transition(Active, Connecting));
        assert!(!CallState::can_transition(Active, Rejected));
    }

    #[test]
    fn test_session_remote_peer() {
        let session = CallSession::new(
            CallId::from("c1"),
            CallKind::Voice,
            CallState::OutgoingRinging,
            UserId::from("u1"),
            UserId::from("u2"),
        );
        assert_eq!(session.remote_peer(&UserId::from("u1")), &UserId::from("u2"));
        assert_eq!(session.remote_peer(&UserId::from("u2")), &UserId::from("u1"));
    }

    #[test]
    fn test_session_participant_media() {
        let mut session = CallSession::new(
            CallId::from("c1"),
            CallKind::Video,
            CallState::Connecting,
            UserId::from("u1"),
            UserId::from("u2"),
        );
        session.set_participant_media(&UserId::from("u2"), Some(false), None);
        let p = session
            .participants
            .iter()
            .find(|p| p.user_id == UserId::from("u2"))
            .unwrap();
        assert!(!p.media.audio_enabled);
        assert!(p.media.video_enabled);
    }

    #[test]
    fn test_quality_classification() {
        assert_eq!(
            ConnectionQualitySample::classify(40, 0, 5),
            QualityLevel::Excellent
        );
        assert_eq!(
            ConnectionQualitySample::classify(150, 1, 10),
            QualityLevel::Good
        );
        assert_eq!(
            ConnectionQualitySample::classify(250, 10, 30),
            QualityLevel::Fair
        );
        assert_eq!(
            ConnectionQualitySample::classify(500, 30, 90),
            QualityLevel::Poor
        );
    }

    #[test]
    fn test_signal_envelope_serialization() {
        let env = SignalEnvelope {
            call_id: CallId::from("c1"),
            kind: SignalKind::IceCandidate,
            data: serde_json::json!({"candidate": "candidate:1 1 UDP ..."}),
            target_user_id: Some(UserId::from("u2")),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"ice-candidate\""));
        let back: SignalEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
