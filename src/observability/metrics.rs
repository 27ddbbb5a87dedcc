//! Metrics collection using metrics-rs.

use metrics::{Counter, Unit, counter};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const PACKETS_PULLED: &str = "graphbridge_packets_pulled";
const BYTES_PULLED: &str = "graphbridge_bytes_pulled";
const PULL_TIMEOUTS: &str = "graphbridge_pull_timeouts";
const PACKETS_DROPPED: &str = "graphbridge_packets_dropped";
const PACKETS_PUSHED: &str = "graphbridge_packets_pushed";
const BYTES_PUSHED: &str = "graphbridge_bytes_pushed";
const PUSH_PARTIAL: &str = "graphbridge_push_partial";
const FEEDBACK_DROPPED_BYTES: &str = "graphbridge_feedback_dropped_bytes";
const EVENTS_INTERCEPTED: &str = "graphbridge_events_intercepted";
const LIFECYCLE_EVENTS: &str = "graphbridge_lifecycle_events";
const CALLBACKS_REJECTED: &str = "graphbridge_callbacks_rejected";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        PACKETS_PULLED,
        Unit::Count,
        "Packets handed to the graph by packet sources"
    );
    metrics::describe_counter!(BYTES_PULLED, Unit::Bytes, "Bytes handed to the graph");
    metrics::describe_counter!(
        PULL_TIMEOUTS,
        Unit::Count,
        "Pulls that returned zero bytes because the transport had nothing"
    );
    metrics::describe_counter!(
        PACKETS_DROPPED,
        Unit::Count,
        "Inbound packets dropped before reaching the graph"
    );
    metrics::describe_counter!(
        PACKETS_PUSHED,
        Unit::Count,
        "Feedback packets offered to the transport"
    );
    metrics::describe_counter!(BYTES_PUSHED, Unit::Bytes, "Feedback bytes accepted");
    metrics::describe_counter!(
        PUSH_PARTIAL,
        Unit::Count,
        "Pushes where the transport accepted fewer bytes than offered"
    );
    metrics::describe_counter!(
        FEEDBACK_DROPPED_BYTES,
        Unit::Bytes,
        "Feedback bytes abandoned after retries ran out"
    );
    metrics::describe_counter!(
        EVENTS_INTERCEPTED,
        Unit::Count,
        "Pad events seen by interceptors, by decision"
    );
    metrics::describe_counter!(
        LIFECYCLE_EVENTS,
        Unit::Count,
        "Lifecycle events delivered to the host"
    );
    metrics::describe_counter!(
        CALLBACKS_REJECTED,
        Unit::Count,
        "Engine callbacks turned away after teardown began"
    );
}

/// Record a lifecycle event delivered to the host.
#[inline]
pub fn record_lifecycle(session: &str, kind: &str) {
    counter!(LIFECYCLE_EVENTS, "session" => session.to_string(), "kind" => kind.to_string())
        .increment(1);
}

/// Record an intercepted pad event and what the policy did with it.
#[inline]
pub fn record_event(session: &str, pad: &str, event: &str, decision: &str) {
    counter!(
        EVENTS_INTERCEPTED,
        "session" => session.to_string(),
        "pad" => pad.to_string(),
        "event" => event.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record feedback bytes abandoned by a retrying outlet.
#[inline]
pub fn record_feedback_dropped(element: &str, bytes: usize) {
    counter!(FEEDBACK_DROPPED_BYTES, "element" => element.to_string()).increment(bytes as u64);
}

/// Metrics for one session's adapters.
///
/// Counter handles are resolved once so the streaming path only increments.
#[derive(Clone)]
pub struct SessionMetrics {
    session: String,
    packets_pulled: Counter,
    bytes_pulled: Counter,
    pull_timeouts: Counter,
    packets_dropped: Counter,
    packets_pushed: Counter,
    bytes_pushed: Counter,
    push_partial: Counter,
    callbacks_rejected: Counter,
}

impl SessionMetrics {
    /// Create a collector labelled with the session name.
    pub fn new(session: &str) -> Self {
        let label = session.to_string();
        Self {
            session: label.clone(),
            packets_pulled: counter!(PACKETS_PULLED, "session" => label.clone()),
            bytes_pulled: counter!(BYTES_PULLED, "session" => label.clone()),
            pull_timeouts: counter!(PULL_TIMEOUTS, "session" => label.clone()),
            packets_dropped: counter!(PACKETS_DROPPED, "session" => label.clone()),
            packets_pushed: counter!(PACKETS_PUSHED, "session" => label.clone()),
            bytes_pushed: counter!(BYTES_PUSHED, "session" => label.clone()),
            push_partial: counter!(PUSH_PARTIAL, "session" => label.clone()),
            callbacks_rejected: counter!(CALLBACKS_REJECTED, "session" => label),
        }
    }

    /// Record a packet handed to the graph.
    #[inline]
    pub fn record_pull(&self, bytes: usize) {
        self.packets_pulled.increment(1);
        self.bytes_pulled.increment(bytes as u64);
    }

    /// Record a pull that found the transport empty.
    #[inline]
    pub fn record_pull_timeout(&self) {
        self.pull_timeouts.increment(1);
    }

    /// Record an inbound packet dropped before the graph saw it.
    #[inline]
    pub fn record_drop(&self) {
        self.packets_dropped.increment(1);
    }

    /// Record a push of `offered` bytes of which `accepted` were taken.
    #[inline]
    pub fn record_push(&self, offered: usize, accepted: usize) {
        self.packets_pushed.increment(1);
        self.bytes_pushed.increment(accepted as u64);
        if accepted < offered {
            self.push_partial.increment(1);
        }
    }

    /// Record a callback that arrived after teardown began.
    #[inline]
    pub fn record_rejected(&self) {
        self.callbacks_rejected.increment(1);
    }

    /// Get the session name.
    pub fn session(&self) -> &str {
        &self.session
    }
}

impl std::fmt::Debug for SessionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMetrics")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic when called multiple times
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_session_metrics() {
        let metrics = SessionMetrics::new("call-7");
        assert_eq!(metrics.session(), "call-7");

        // Without a recorder installed these are no-ops
        metrics.record_pull(1200);
        metrics.record_pull_timeout();
        metrics.record_drop();
        metrics.record_push(80, 40);
        metrics.record_rejected();
    }

    #[test]
    fn test_free_functions() {
        record_lifecycle("call-7", "eos");
        record_event("call-7", "depay.sink", "caps", "replace");
        record_feedback_dropped("rtcpsink", 64);
    }
}
