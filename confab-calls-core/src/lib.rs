//! Confab Calls - peer-to-peer voice and video calling core
//!
//! This library implements the call orchestration layer of the Confab
//! messenger: the call lifecycle state machine, the signaling channel to
//! the call server, per-call realtime session management, and failure
//! recovery. It features:
//!
//! - **Serialized state machine**: every call event flows through one
//!   controller loop, so transitions are validated in a single place
//! - **At-least-once tolerant signaling**: redelivered server events are
//!   deduplicated by content fingerprint; finished calls are tombstoned
//! - **Pluggable media stack**: device access and peer negotiation live
//!   behind traits supplied by the host application
//! - **Classified recovery**: failures map to a taxonomy with per-call
//!   retry budgets and exponential backoff
//!
//! # Examples
//!
//! ```rust,ignore
//! use confab_calls_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     transport: Arc<impl SignalingTransport>,
//! #     devices: Arc<dyn MediaDevices>,
//! #     engines: Arc<dyn EngineFactory>,
//! # ) -> anyhow::Result<()> {
//! let channel = Arc::new(SignalingChannel::new(transport, SignalingConfig::default()));
//! channel.start(AuthToken::new("bearer-token")).await?;
//!
//! let config = ControllerConfig::new(UserId::new("alice"));
//! let calls = CallController::spawn(
//!     config,
//!     channel,
//!     devices,
//!     engines,
//!     Arc::new(NullNotifier),
//!     Arc::new(NullCallHistory),
//! );
//!
//! let call_id = calls.initiate(UserId::new("bob"), CallKind::Video).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Contracts for external collaborators (notifications, history, auth)
pub mod collaborators;

/// Signaling channel and wire events
pub mod signaling;

/// Per-call realtime session adapter
pub mod session;

/// Error taxonomy and recovery policy
pub mod recovery;

/// Shared call state store
pub mod store;

/// Call session controller
pub mod controller;

// Re-export main types at crate root
pub use collaborators::{
    AuthToken, CallHistory, NotificationId, Notifier, NullCallHistory, NullNotifier, SoundKind,
};
pub use controller::{
    CallController, CallControllerHandle, CallError, CallEvent, ControllerConfig,
};
pub use recovery::{
    CallErrorKind, CallErrorStats, ErrorRecord, QualityMonitor, RecoveryDecision, RecoveryIntent,
    RecoveryManager, RecoveryPolicy, Severity,
};
pub use session::{
    DescriptionKind, EngineConnectionState, EngineFactory, LocalMedia, MediaAcquisitionError,
    MediaConstraints, MediaDevices, MediaStreamHandle, NegotiationEngine, NegotiationState,
    RealtimeSession, RemoteCandidate, SessionDescription, SessionError, TrackHandle, TrackKind,
};
pub use signaling::{
    ClientEvent, ServerEvent, SignalingChannel, SignalingConfig, SignalingError,
    SignalingTransport,
};
pub use store::CallStateStore;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::collaborators::{
        AuthToken, CallHistory, Notifier, NullCallHistory, NullNotifier,
    };
    pub use crate::controller::{
        CallController, CallControllerHandle, CallError, CallEvent, ControllerConfig,
    };
    pub use crate::recovery::{CallErrorKind, RecoveryIntent, RecoveryPolicy};
    pub use crate::session::{EngineFactory, MediaConstraints, MediaDevices, NegotiationEngine};
    pub use crate::signaling::{SignalingChannel, SignalingConfig, SignalingTransport};
    pub use crate::store::CallStateStore;
    pub use crate::types::{CallId, CallKind, CallRole, CallState, UserId};
}
