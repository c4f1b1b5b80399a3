//! Call state store.
//!
//! Single shared container for call-affecting state. The controller loop
//! is the only writer (the mutators are crate-private); any task holding a
//! clone may read a consistent snapshot. At most one call occupies the
//! store at a time.

use crate::session::MediaStreamHandle;
use crate::types::{CallId, CallSession, CallState, IncomingCallOffer, QualityLevel};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct StoreInner {
    session: Option<CallSession>,
    incoming: Option<IncomingCallOffer>,
    signaling_connected: bool,
    local_stream: Option<MediaStreamHandle>,
    remote_stream: Option<MediaStreamHandle>,
    quality: Option<QualityLevel>,
}

/// Shared, read-mostly view of call state.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CallStateStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl CallStateStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active call session, if any
    #[must_use]
    pub fn session(&self) -> Option<CallSession> {
        self.inner.read().session.clone()
    }

    /// The pending incoming offer, if any
    #[must_use]
    pub fn incoming_offer(&self) -> Option<IncomingCallOffer> {
        self.inner.read().incoming.clone()
    }

    /// Effective call state.
    ///
    /// A pending incoming offer with no session yet reads as
    /// `IncomingRinging`; no call at all reads as `Idle`.
    #[must_use]
    pub fn call_state(&self) -> CallState {
        let inner = self.inner.read();
        match (&inner.session, &inner.incoming) {
            (Some(session), _) => session.state,
            (None, Some(_)) => CallState::IncomingRinging,
            (None, None) => CallState::Idle,
        }
    }

    /// Id of the call currently occupying the store, if any
    #[must_use]
    pub fn current_call_id(&self) -> Option<CallId> {
        let inner = self.inner.read();
        inner
            .session
            .as_ref()
            .map(|s| s.call_id.clone())
            .or_else(|| inner.incoming.as_ref().map(|o| o.call_id.clone()))
    }

    /// Whether any call (ringing or established) occupies the store
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.read();
        inner.session.is_some() || inner.incoming.is_some()
    }

    /// Whether the signaling channel is currently connected
    #[must_use]
    pub fn signaling_connected(&self) -> bool {
        self.inner.read().signaling_connected
    }

    /// Local media stream handle, once acquired
    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.read().local_stream.clone()
    }

    /// Remote media stream handle, once received
    #[must_use]
    pub fn remote_stream(&self) -> Option<MediaStreamHandle> {
        self.inner.read().remote_stream.clone()
    }

    /// Latest classified connection quality, while a call is active
    #[must_use]
    pub fn quality(&self) -> Option<QualityLevel> {
        self.inner.read().quality
    }

    pub(crate) fn set_session(&self, session: CallSession) {
        self.inner.write().session = Some(session);
    }

    /// Mutate the active session in place. Returns false if no session
    /// exists or its id differs.
    pub(crate) fn update_session<F>(&self, call_id: &CallId, f: F) -> bool
    where
        F: FnOnce(&mut CallSession),
    {
        let mut inner = self.inner.write();
        match inner.session.as_mut() {
            Some(session) if &session.call_id == call_id => {
                f(session);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_incoming(&self, offer: IncomingCallOffer) {
        self.inner.write().incoming = Some(offer);
    }

    pub(crate) fn take_incoming(&self, call_id: &CallId) -> Option<IncomingCallOffer> {
        let mut inner = self.inner.write();
        if inner.incoming.as_ref().is_some_and(|o| &o.call_id == call_id) {
            inner.incoming.take()
        } else {
            None
        }
    }

    pub(crate) fn set_signaling_connected(&self, connected: bool) {
        self.inner.write().signaling_connected = connected;
    }

    pub(crate) fn set_local_stream(&self, stream: Option<MediaStreamHandle>) {
        self.inner.write().local_stream = stream;
    }

    pub(crate) fn set_remote_stream(&self, stream: Option<MediaStreamHandle>) {
        self.inner.write().remote_stream = stream;
    }

    pub(crate) fn set_quality(&self, quality: Option<QualityLevel>) {
        self.inner.write().quality = quality;
    }

    /// Clear everything tied to the finished call, leaving the signaling
    /// connectivity flag alone.
    pub(crate) fn clear_call(&self) {
        let mut inner = self.inner.write();
        inner.session = None;
        inner.incoming = None;
        inner.local_stream = None;
        inner.remote_stream = None;
        inner.quality = None;
    }
}
