//! Contracts for external collaborators.
//!
//! The calling core consumes the rest of the messenger through these narrow
//! seams: notifications and sounds, call history, and an opaque bearer token
//! for the signaling transport. Implementations live in the host
//! application; tests use the no-op [`NullNotifier`].

use crate::types::{CallRecord, IncomingCallOffer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque bearer token handed to the signaling transport.
///
/// The calling core never parses or validates it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a bearer token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the raw token for transmission
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log token material
        write!(f, "AuthToken(***)")
    }
}

/// Identifier of a shown notification, for later dismissal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationId(pub String);

/// Named call sounds the notifier can play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundKind {
    /// Incoming-call ring
    Ring,
    /// Outgoing-call ringback
    Ringback,
    /// Call-ended chime
    End,
}

/// Notification and sound collaborator
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Show an incoming-call notification; returns an id if one was shown
    async fn show_incoming_call(
        &self,
        caller_name: &str,
        offer: &IncomingCallOffer,
    ) -> Option<NotificationId>;

    /// Dismiss a previously shown incoming-call notification
    async fn dismiss_notification(&self, id: &NotificationId);

    /// Show a transient status notification
    async fn show_status(&self, title: &str, message: &str);

    /// Start playing a named sound
    async fn play_sound(&self, kind: SoundKind, looped: bool);

    /// Stop a named sound
    async fn stop_sound(&self, kind: SoundKind);
}

/// Call-history collaborator
#[async_trait]
pub trait CallHistory: Send + Sync {
    /// Fetch the persisted call history, newest first
    async fn fetch_call_history(&self) -> anyhow::Result<Vec<CallRecord>>;
}

/// Notifier that does nothing; useful headless and in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn show_incoming_call(
        &self,
        _caller_name: &str,
        _offer: &IncomingCallOffer,
    ) -> Option<NotificationId> {
        None
    }

    async fn dismiss_notification(&self, _id: &NotificationId) {}

    async fn show_status(&self, _title: &str, _message: &str) {}

    async fn play_sound(&self, _kind: SoundKind, _looped: bool) {}

    async fn stop_sound(&self, _kind: SoundKind) {}
}

/// History collaborator that has no calls; useful headless and in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCallHistory;

#[async_trait]
impl CallHistory for NullCallHistory {
    async fn fetch_call_history(&self) -> anyhow::Result<Vec<CallRecord>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_token_debug_is_redacted() {
        let token = AuthToken::new("secret-bearer-token");
        assert_eq!(format!("{token:?}"), "AuthToken(***)");
        assert_eq!(token.expose(), "secret-bearer-token");
    }
}
