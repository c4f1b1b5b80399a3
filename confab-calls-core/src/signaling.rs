//! Signaling channel to the call server.
//!
//! Carries call-lifecycle and negotiation messages between peers via the
//! messenger's signaling server. The channel reconnects with exponential
//! backoff and guarantees at-least-once delivery: after a reconnect the
//! server may redeliver events, which is why the controller deduplicates
//! every remote event by content fingerprint.

use crate::collaborators::AuthToken;
use crate::types::{CallId, CallKind, CallRole, CallSummary, CallerInfo, SignalEnvelope, UserId};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::sleep;

/// Signaling channel errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel is not connected
    #[error("signaling channel not connected")]
    NotConnected,

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Channel has been shut down
    #[error("signaling channel closed")]
    Closed,
}

/// Events sent from this client to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Place a call
    #[serde(rename = "call:initiate")]
    Initiate {
        /// Locally minted call id
        call_id: CallId,
        /// Who is being called
        receiver_id: UserId,
        /// Voice or video
        kind: CallKind,
        /// Optional application metadata
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    /// Accept a ringing incoming call
    #[serde(rename = "call:accept")]
    Accept {
        /// Call being accepted
        call_id: CallId,
    },

    /// Reject a ringing incoming call
    #[serde(rename = "call:reject")]
    Reject {
        /// Call being rejected
        call_id: CallId,
        /// Optional machine-readable reason
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Hang up
    #[serde(rename = "call:end")]
    End {
        /// Call being ended
        call_id: CallId,
        /// Optional machine-readable reason
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Negotiation offer for the remote peer
    #[serde(rename = "webrtc:offer")]
    Offer(SignalEnvelope),

    /// Negotiation answer for the remote peer
    #[serde(rename = "webrtc:answer")]
    Answer(SignalEnvelope),

    /// Connectivity candidate for the remote peer
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate(SignalEnvelope),

    /// Local media flags changed
    #[serde(rename = "call:media-status")]
    MediaStatus {
        /// Call the change belongs to
        call_id: CallId,
        /// New audio flag, if changed
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<bool>,
        /// New video flag, if changed
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<bool>,
    },
}

/// Events delivered from the signaling server to this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A peer is calling the local user
    #[serde(rename = "call:incoming")]
    Incoming {
        /// Call identifier
        call_id: CallId,
        /// Call summary
        call: CallSummary,
        /// Who is calling
        caller: CallerInfo,
    },

    /// The remote peer accepted an outgoing call
    #[serde(rename = "call:accepted")]
    Accepted {
        /// Call identifier
        call_id: CallId,
        /// Call summary
        call: CallSummary,
        /// Who accepted
        accepted_by: UserId,
        /// Server-resolved role of the local user, when available
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<CallRole>,
    },

    /// The call was rejected
    #[serde(rename = "call:rejected")]
    Rejected {
        /// Call identifier
        call_id: CallId,
        /// Who rejected, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        rejected_by: Option<UserId>,
        /// Optional machine-readable reason (e.g. `user_busy`)
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// The call was ended by a peer
    #[serde(rename = "call:ended")]
    Ended {
        /// Call identifier
        call_id: CallId,
        /// Who hung up, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        ended_by: Option<UserId>,
        /// Optional machine-readable reason
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Server-side call error
    #[serde(rename = "call:error")]
    Error {
        /// Human-readable message
        message: String,
        /// Call the error belongs to, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        /// Client event that triggered the error, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },

    /// Negotiation offer from the remote peer
    #[serde(rename = "webrtc:offer")]
    Offer(SignalEnvelope),

    /// Negotiation answer from the remote peer
    #[serde(rename = "webrtc:answer")]
    Answer(SignalEnvelope),

    /// Connectivity candidate from the remote peer
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate(SignalEnvelope),

    /// A participant's media flags changed
    #[serde(rename = "call:media-status")]
    MediaStatus {
        /// Call the change belongs to
        call_id: CallId,
        /// Whose flags changed
        user_id: UserId,
        /// New audio flag, if changed
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<bool>,
        /// New video flag, if changed
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<bool>,
    },
}

impl ServerEvent {
    /// The call id this event belongs to, if it carries one
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Incoming { call_id, .. }
            | Self::Accepted { call_id, .. }
            | Self::Rejected { call_id, .. }
            | Self::Ended { call_id, .. }
            | Self::MediaStatus { call_id, .. } => Some(call_id),
            Self::Offer(env) | Self::Answer(env) | Self::IceCandidate(env) => Some(&env.call_id),
            Self::Error { call_id, .. } => call_id.as_ref(),
        }
    }

    /// Short event name for fingerprints and tracing
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "incoming",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Ended { .. } => "ended",
            Self::Error { .. } => "error",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::MediaStatus { .. } => "media-status",
        }
    }
}

/// Transport seam for the signaling channel.
///
/// Implement this for the messenger's actual server connection (a
/// websocket, a long-poll loop, ...). `receive_event` resolves with an
/// error on connection loss; the channel then reconnects with backoff and
/// resumes receiving. Implementations may redeliver events after a
/// reconnect.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish (or re-establish) the server connection
    async fn connect(&self, token: &AuthToken) -> Result<(), Self::Error>;

    /// Send an event to the server
    async fn send_event(&self, event: ClientEvent) -> Result<(), Self::Error>;

    /// Receive the next event from the server
    async fn receive_event(&self) -> Result<ServerEvent, Self::Error>;
}

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Delay ceiling
    pub reconnect_max_delay: Duration,
    /// Capacity of the event fan-out channel
    pub event_buffer: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Persistent, reconnecting signaling channel.
///
/// Wraps a [`SignalingTransport`], runs a receive loop and fans incoming
/// events out through a broadcast channel. Connection loss never ends an
/// active call by itself: it only flips the status watch, which the
/// controller routes to the recovery manager as `ConnectionLost`.
pub struct SignalingChannel<T: SignalingTransport> {
    transport: Arc<T>,
    config: SignalingConfig,
    events: broadcast::Sender<ServerEvent>,
    connected: watch::Sender<bool>,
    reconnect_kick: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

impl<T: SignalingTransport> SignalingChannel<T> {
    /// Create a channel over the given transport
    #[must_use]
    pub fn new(transport: Arc<T>, config: SignalingConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            config,
            events,
            connected,
            reconnect_kick: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Connect and start the receive loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial connection attempt fails; later
    /// connection losses are handled by the internal reconnect loop.
    #[tracing::instrument(skip(self, token))]
    pub async fn start(&self, token: AuthToken) -> Result<(), SignalingError> {
        self.transport
            .connect(&token)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        // send_replace, not send: the flag must flip even before anyone
        // subscribes to the status watch
        self.connected.send_replace(true);
        tracing::info!("signaling channel connected");

        let transport = self.transport.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();
        let kick = self.reconnect_kick.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("signaling receive loop shutting down");
                            break;
                        }
                    }
                    result = transport.receive_event() => {
                        match result {
                            Ok(event) => {
                                attempt = 0;
                                if !*connected.borrow() {
                                    connected.send_replace(true);
                                }
                                tracing::debug!(
                                    event = event.kind_name(),
                                    call_id = ?event.call_id(),
                                    "received signaling event"
                                );
                                let _ = events.send(event);
                            }
                            Err(e) => {
                                connected.send_replace(false);
                                attempt = attempt.saturating_add(1);
                                let delay = reconnect_delay(&config, attempt);
                                tracing::warn!(
                                    error = %e,
                                    attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    "signaling connection lost, reconnecting"
                                );
                                tokio::select! {
                                    _ = sleep(delay) => {}
                                    _ = kick.notified() => {
                                        tracing::debug!("reconnect requested, skipping backoff");
                                    }
                                    _ = shutdown_rx.changed() => {
                                        if *shutdown_rx.borrow() { break; }
                                    }
                                }
                                match transport.connect(&token).await {
                                    Ok(()) => {
                                        attempt = 0;
                                        connected.send_replace(true);
                                        tracing::info!("signaling channel reconnected");
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "reconnect attempt failed");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Send an event to the server
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is disconnected or the transport
    /// send fails.
    pub async fn send(&self, event: ClientEvent) -> Result<(), SignalingError> {
        if !*self.connected.borrow() {
            return Err(SignalingError::NotConnected);
        }
        self.transport
            .send_event(event)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Subscribe to incoming server events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Watch the connected flag
    #[must_use]
    pub fn status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Whether the channel is currently connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Ask the reconnect loop to retry immediately instead of waiting out
    /// its current backoff delay
    pub fn request_reconnect(&self) {
        self.reconnect_kick.notify_one();
    }

    /// Stop the receive loop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

fn reconnect_delay(config: &SignalingConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = config
        .reconnect_base_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.reconnect_max_delay);
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}
