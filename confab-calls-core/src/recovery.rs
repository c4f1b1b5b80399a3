//! Error taxonomy and recovery policy.
//!
//! Every call-affecting failure is classified into a [`CallErrorKind`].
//! Recoverable kinds map to a [`RecoveryIntent`] and are retried with
//! exponential backoff; after the attempt budget is spent (or for fatal
//! kinds immediately) the call transitions to failed. Retry counters are
//! tracked per call and per kind so an unrelated signaling hiccup does not
//! eat the budget of a media retry.

use crate::types::{CallId, ConnectionQualitySample, QualityLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Classified call failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorKind {
    /// User denied camera/microphone permission
    MediaPermissionDenied,
    /// No matching capture device exists
    MediaDeviceNotFound,
    /// Capture device held by another application
    MediaDeviceInUse,
    /// Local media stream stopped unexpectedly
    MediaStreamFailed,
    /// Signaling channel send or protocol error
    SignalingError,
    /// Signaling connection dropped mid-call
    ConnectionLost,
    /// A signaling round trip timed out
    NetworkTimeout,
    /// Media-path connectivity checks failed
    IceConnectionFailed,
    /// Offer/answer exchange failed or produced an unusable description
    OfferAnswerFailed,
    /// The remote peer is unreachable or not registered
    PeerUnavailable,
    /// The server refused the call
    ServerRejected,
    /// Call setup did not complete in time
    SetupTimeout,
    /// Unclassified failure
    Internal,
}

/// How bad a failure is, independent of whether it gets retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// Expected call outcome, nothing to surface loudly
    Low,
    /// Degraded but routine; retries usually absorb it
    Medium,
    /// Call-threatening
    High,
    /// Cannot proceed at all without user or environment changes
    Critical,
}

/// One classified failure, as kept in per-call statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Classified kind
    pub kind: CallErrorKind,
    /// Default severity for the kind
    pub severity: Severity,
    /// Whether the kind maps to a recovery intent
    pub recoverable: bool,
    /// The call the failure belongs to, when known
    pub call_id: Option<CallId>,
    /// Retry attempts made for this (call, kind) so far
    pub retry_count: u32,
    /// When the failure was reported
    pub timestamp: DateTime<Utc>,
}

/// What a recovery attempt should actually do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryIntent {
    /// Reconnect the signaling channel, keeping call state
    ReconnectSignaling,
    /// Restart connectivity checks on the existing media session
    IceRestart,
    /// Re-acquire the local capture devices
    RetryMediaAcquisition,
}

impl CallErrorKind {
    /// Recovery intent for this kind; `None` means the kind is fatal
    #[must_use]
    pub fn intent(self) -> Option<RecoveryIntent> {
        match self {
            Self::SignalingError | Self::ConnectionLost | Self::NetworkTimeout => {
                Some(RecoveryIntent::ReconnectSignaling)
            }
            Self::IceConnectionFailed | Self::OfferAnswerFailed => {
                Some(RecoveryIntent::IceRestart)
            }
            Self::MediaDeviceInUse | Self::MediaStreamFailed => {
                Some(RecoveryIntent::RetryMediaAcquisition)
            }
            Self::MediaPermissionDenied
            | Self::MediaDeviceNotFound
            | Self::PeerUnavailable
            | Self::ServerRejected
            | Self::SetupTimeout
            | Self::Internal => None,
        }
    }

    /// Whether this kind is worth retrying at all
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        self.intent().is_some()
    }

    /// Default severity for this kind
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::ServerRejected => Severity::Low,
            Self::NetworkTimeout
            | Self::SignalingError
            | Self::MediaDeviceInUse
            | Self::MediaStreamFailed
            | Self::OfferAnswerFailed
            | Self::PeerUnavailable
            | Self::SetupTimeout => Severity::Medium,
            Self::ConnectionLost | Self::IceConnectionFailed | Self::Internal => Severity::High,
            Self::MediaPermissionDenied | Self::MediaDeviceNotFound => Severity::Critical,
        }
    }

    /// Human-readable description for status surfaces
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::MediaPermissionDenied => "camera or microphone permission denied",
            Self::MediaDeviceNotFound => "no camera or microphone found",
            Self::MediaDeviceInUse => "camera or microphone in use by another app",
            Self::MediaStreamFailed => "local media stream failed",
            Self::SignalingError => "signaling error",
            Self::ConnectionLost => "connection lost",
            Self::NetworkTimeout => "network timeout",
            Self::IceConnectionFailed => "peer connection failed",
            Self::OfferAnswerFailed => "call negotiation failed",
            Self::PeerUnavailable => "the other person is unreachable",
            Self::ServerRejected => "call refused by server",
            Self::SetupTimeout => "call setup timed out",
            Self::Internal => "internal call error",
        }
    }
}

/// Retry budget and backoff shape
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
    /// Attempts per (call, kind) before giving up
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

/// Outcome of classifying a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Schedule a retry after `delay`
    Retry {
        /// What the retry should do
        intent: RecoveryIntent,
        /// 1-based attempt number
        attempt: u32,
        /// Backoff before executing the intent
        delay: Duration,
    },
    /// Budget exhausted or the kind is fatal; fail the call
    Fatal,
}

/// Failure counts for one call, discarded with the call
#[derive(Debug, Default, Clone, Serialize)]
pub struct CallErrorStats {
    /// Total failures reported for the call
    pub total: u32,
    /// Counts by kind
    pub by_kind: HashMap<CallErrorKind, u32>,
    /// Counts by severity
    pub by_severity: HashMap<Severity, u32>,
    /// Most recent failure
    pub last: Option<ErrorRecord>,
}

/// Per-call, per-kind retry bookkeeping and error statistics.
///
/// Owned by the controller loop; no internal locking needed.
#[derive(Debug)]
pub struct RecoveryManager {
    policy: RecoveryPolicy,
    attempts: HashMap<(CallId, CallErrorKind), u32>,
    stats: HashMap<CallId, CallErrorStats>,
}

impl RecoveryManager {
    /// Create a manager with the given policy
    #[must_use]
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            attempts: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    /// Report a failure and decide what to do about it.
    ///
    /// Increments the (call, kind) counter on every recoverable report, so
    /// repeated reports walk the backoff ladder: 1s, 2s, 4s, then fatal
    /// under the default policy.
    pub fn report(&mut self, call_id: &CallId, kind: CallErrorKind) -> RecoveryDecision {
        let Some(intent) = kind.intent() else {
            self.note_failure(call_id, kind, 0);
            tracing::warn!(call_id = %call_id, ?kind, "unrecoverable call error");
            return RecoveryDecision::Fatal;
        };

        let attempt = self
            .attempts
            .entry((call_id.clone(), kind))
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let attempt = *attempt;
        self.note_failure(call_id, kind, attempt);

        if attempt > self.policy.max_attempts {
            tracing::warn!(
                call_id = %call_id,
                ?kind,
                attempts = attempt - 1,
                "retry budget exhausted"
            );
            return RecoveryDecision::Fatal;
        }

        let delay = self
            .policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1));
        tracing::info!(
            call_id = %call_id,
            ?kind,
            ?intent,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling recovery"
        );
        RecoveryDecision::Retry {
            intent,
            attempt,
            delay,
        }
    }

    /// Reset the counter for one kind after its recovery succeeded
    pub fn record_success(&mut self, call_id: &CallId, kind: CallErrorKind) {
        if self.attempts.remove(&(call_id.clone(), kind)).is_some() {
            tracing::debug!(call_id = %call_id, ?kind, "recovery succeeded, counter reset");
        }
    }

    /// Drop all counters and statistics for a finished call
    pub fn purge_call(&mut self, call_id: &CallId) {
        self.attempts.retain(|(id, _), _| id != call_id);
        self.stats.remove(call_id);
    }

    /// Attempts recorded for a (call, kind) pair
    #[must_use]
    pub fn attempts(&self, call_id: &CallId, kind: CallErrorKind) -> u32 {
        self.attempts
            .get(&(call_id.clone(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Error statistics accumulated for a call, if any were reported
    #[must_use]
    pub fn call_stats(&self, call_id: &CallId) -> Option<&CallErrorStats> {
        self.stats.get(call_id)
    }

    fn note_failure(&mut self, call_id: &CallId, kind: CallErrorKind, retry_count: u32) {
        let record = ErrorRecord {
            kind,
            severity: kind.severity(),
            recoverable: kind.is_recoverable(),
            call_id: Some(call_id.clone()),
            retry_count,
            timestamp: Utc::now(),
        };
        let stats = self.stats.entry(call_id.clone()).or_default();
        stats.total += 1;
        *stats.by_kind.entry(kind).or_insert(0) += 1;
        *stats.by_severity.entry(record.severity).or_insert(0) += 1;
        stats.last = Some(record);
    }
}

/// Result of feeding one quality sample to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityObservation {
    /// Classified level for this sample
    pub level: QualityLevel,
    /// Level changed since the previous sample
    pub level_changed: bool,
    /// Quality has been poor long enough to treat as a lost connection.
    /// Reported once per degradation, not once per sample.
    pub connection_degraded: bool,
}

/// Watches periodic quality samples for sustained degradation.
///
/// A single poor sample is noise; `threshold` consecutive poor (or
/// disconnected) samples synthesize a connection-lost report so the
/// recovery path engages without waiting for the engine to give up.
#[derive(Debug)]
pub struct QualityMonitor {
    threshold: u32,
    consecutive_poor: u32,
    degradation_reported: bool,
    last_level: Option<QualityLevel>,
}

impl QualityMonitor {
    /// Create a monitor triggering after `threshold` consecutive poor samples
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_poor: 0,
            degradation_reported: false,
            last_level: None,
        }
    }

    /// Feed one sample and classify it
    pub fn observe(&mut self, sample: &ConnectionQualitySample) -> QualityObservation {
        let level = sample.level;
        let level_changed = self.last_level != Some(level);
        self.last_level = Some(level);

        if level <= QualityLevel::Poor {
            self.consecutive_poor += 1;
        } else {
            self.consecutive_poor = 0;
            self.degradation_reported = false;
        }

        let connection_degraded =
            self.consecutive_poor >= self.threshold && !self.degradation_reported;
        if connection_degraded {
            self.degradation_reported = true;
            tracing::warn!(
                consecutive_poor = self.consecutive_poor,
                "sustained poor quality, treating as degraded connection"
            );
        }

        QualityObservation {
            level,
            level_changed,
            connection_degraded,
        }
    }

    /// Forget history, e.g. when a new call starts
    pub fn reset(&mut self) {
        self.consecutive_poor = 0;
        self.degradation_reported = false;
        self.last_level = None;
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call(id: &str) -> CallId {
        CallId::from(id)
    }

    #[test]
    fn test_backoff_ladder_then_fatal() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let id = call("c1");

        for (expected_attempt, expected_secs) in [(1, 1), (2, 2), (3, 4)] {
            match mgr.report(&id, CallErrorKind::ConnectionLost) {
                RecoveryDecision::Retry {
                    intent,
                    attempt,
                    delay,
                } => {
                    assert_eq!(intent, RecoveryIntent::ReconnectSignaling);
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(delay, Duration::from_secs(expected_secs));
                }
                RecoveryDecision::Fatal => panic!("attempt {expected_attempt} should retry"),
            }
        }
        assert_eq!(
            mgr.report(&id, CallErrorKind::ConnectionLost),
            RecoveryDecision::Fatal
        );
    }

    #[test]
    fn test_fatal_kinds_never_retry() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let id = call("c1");
        for kind in [
            CallErrorKind::MediaPermissionDenied,
            CallErrorKind::MediaDeviceNotFound,
            CallErrorKind::PeerUnavailable,
            CallErrorKind::ServerRejected,
            CallErrorKind::SetupTimeout,
            CallErrorKind::Internal,
        ] {
            assert_eq!(mgr.report(&id, kind), RecoveryDecision::Fatal);
            assert_eq!(mgr.attempts(&id, kind), 0);
        }
    }

    #[test]
    fn test_counters_independent_per_kind_and_call() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let a = call("a");
        let b = call("b");

        mgr.report(&a, CallErrorKind::ConnectionLost);
        mgr.report(&a, CallErrorKind::ConnectionLost);
        mgr.report(&a, CallErrorKind::IceConnectionFailed);
        mgr.report(&b, CallErrorKind::ConnectionLost);

        assert_eq!(mgr.attempts(&a, CallErrorKind::ConnectionLost), 2);
        assert_eq!(mgr.attempts(&a, CallErrorKind::IceConnectionFailed), 1);
        assert_eq!(mgr.attempts(&b, CallErrorKind::ConnectionLost), 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let id = call("c1");

        mgr.report(&id, CallErrorKind::ConnectionLost);
        mgr.report(&id, CallErrorKind::ConnectionLost);
        mgr.record_success(&id, CallErrorKind::ConnectionLost);

        // Next failure starts the ladder over at 1s
        match mgr.report(&id, CallErrorKind::ConnectionLost) {
            RecoveryDecision::Retry { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_secs(1));
            }
            RecoveryDecision::Fatal => panic!("should retry after reset"),
        }
    }

    #[test]
    fn test_purge_call_drops_all_kinds() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let a = call("a");
        let b = call("b");
        mgr.report(&a, CallErrorKind::ConnectionLost);
        mgr.report(&a, CallErrorKind::MediaDeviceInUse);
        mgr.report(&b, CallErrorKind::ConnectionLost);

        mgr.purge_call(&a);

        assert_eq!(mgr.attempts(&a, CallErrorKind::ConnectionLost), 0);
        assert_eq!(mgr.attempts(&a, CallErrorKind::MediaDeviceInUse), 0);
        assert_eq!(mgr.attempts(&b, CallErrorKind::ConnectionLost), 1);
    }

    #[test]
    fn test_severity_table() {
        assert_eq!(CallErrorKind::ConnectionLost.severity(), Severity::High);
        assert_eq!(CallErrorKind::IceConnectionFailed.severity(), Severity::High);
        assert_eq!(CallErrorKind::NetworkTimeout.severity(), Severity::Medium);
        assert_eq!(CallErrorKind::SignalingError.severity(), Severity::Medium);
        assert_eq!(CallErrorKind::MediaDeviceInUse.severity(), Severity::Medium);
        assert_eq!(CallErrorKind::MediaStreamFailed.severity(), Severity::Medium);
        assert_eq!(CallErrorKind::OfferAnswerFailed.severity(), Severity::Medium);
        assert_eq!(
            CallErrorKind::MediaPermissionDenied.severity(),
            Severity::Critical
        );
        assert_eq!(
            CallErrorKind::MediaDeviceNotFound.severity(),
            Severity::Critical
        );
        assert_eq!(CallErrorKind::ServerRejected.severity(), Severity::Low);
        assert!(Severity::Low < Severity::Critical);
    }

    #[test]
    fn test_stats_accumulate_and_purge_with_call() {
        let mut mgr = RecoveryManager::new(RecoveryPolicy::default());
        let id = call("c1");

        mgr.report(&id, CallErrorKind::ConnectionLost);
        mgr.report(&id, CallErrorKind::ConnectionLost);
        mgr.report(&id, CallErrorKind::MediaPermissionDenied);

        let stats = mgr.call_stats(&id).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind[&CallErrorKind::ConnectionLost], 2);
        assert_eq!(stats.by_severity[&Severity::High], 2);
        assert_eq!(stats.by_severity[&Severity::Critical], 1);

        let last = stats.last.as_ref().unwrap();
        assert_eq!(last.kind, CallErrorKind::MediaPermissionDenied);
        assert!(!last.recoverable);
        assert_eq!(last.retry_count, 0);
        assert_eq!(last.call_id.as_ref(), Some(&id));

        mgr.purge_call(&id);
        assert!(mgr.call_stats(&id).is_none());
    }

    #[test]
    fn test_intent_mapping() {
        assert_eq!(
            CallErrorKind::SignalingError.intent(),
            Some(RecoveryIntent::ReconnectSignaling)
        );
        assert_eq!(
            CallErrorKind::NetworkTimeout.intent(),
            Some(RecoveryIntent::ReconnectSignaling)
        );
        assert_eq!(
            CallErrorKind::IceConnectionFailed.intent(),
            Some(RecoveryIntent::IceRestart)
        );
        assert_eq!(
            CallErrorKind::OfferAnswerFailed.intent(),
            Some(RecoveryIntent::IceRestart)
        );
        assert_eq!(
            CallErrorKind::MediaDeviceInUse.intent(),
            Some(RecoveryIntent::RetryMediaAcquisition)
        );
        assert_eq!(
            CallErrorKind::MediaStreamFailed.intent(),
            Some(RecoveryIntent::RetryMediaAcquisition)
        );
        assert_eq!(CallErrorKind::MediaPermissionDenied.intent(), None);
    }

    fn poor_sample() -> ConnectionQualitySample {
        ConnectionQualitySample::from_measurements(600, 40, 100)
    }

    fn good_sample() -> ConnectionQualitySample {
        ConnectionQualitySample::from_measurements(40, 0, 5)
    }

    #[test]
    fn test_quality_monitor_triggers_after_sustained_poor() {
        let mut monitor = QualityMonitor::new(3);
        assert!(!monitor.observe(&poor_sample()).connection_degraded);
        assert!(!monitor.observe(&poor_sample()).connection_degraded);
        let obs = monitor.observe(&poor_sample());
        assert!(obs.connection_degraded);
        assert_eq!(obs.level, QualityLevel::Poor);

        // No repeated reports while degradation persists
        assert!(!monitor.observe(&poor_sample()).connection_degraded);
    }

    #[test]
    fn test_quality_monitor_resets_on_recovery() {
        let mut monitor = QualityMonitor::new(3);
        monitor.observe(&poor_sample());
        monitor.observe(&poor_sample());
        let obs = monitor.observe(&good_sample());
        assert!(!obs.connection_degraded);
        assert_eq!(obs.level, QualityLevel::Excellent);
        assert!(obs.level_changed);

        // Run starts over and can trigger again
        monitor.observe(&poor_sample());
        monitor.observe(&poor_sample());
        assert!(monitor.observe(&poor_sample()).connection_degraded);
    }
}
