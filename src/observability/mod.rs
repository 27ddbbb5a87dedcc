//! Observability: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `graphbridge_packets_pulled` | Counter | session | Packets handed to the graph |
//! | `graphbridge_bytes_pulled` | Counter | session | Bytes handed to the graph |
//! | `graphbridge_pull_timeouts` | Counter | session | Pulls that found the transport empty |
//! | `graphbridge_packets_dropped` | Counter | session | Inbound packets dropped (oversized) |
//! | `graphbridge_packets_pushed` | Counter | session | Feedback packets offered to the transport |
//! | `graphbridge_bytes_pushed` | Counter | session | Feedback bytes accepted |
//! | `graphbridge_push_partial` | Counter | session | Short writes on the feedback path |
//! | `graphbridge_feedback_dropped_bytes` | Counter | element | Feedback abandoned after retries |
//! | `graphbridge_events_intercepted` | Counter | session, pad, event, decision | Pad events seen by interceptors |
//! | `graphbridge_lifecycle_events` | Counter | session, kind | Lifecycle events delivered to the host |
//! | `graphbridge_callbacks_rejected` | Counter | session | Callbacks turned away during teardown |
//!
//! No recorder is installed by this crate. Install one (prometheus, statsd)
//! in the host application and call [`init_metrics`] once.
//!
//! ## Tracing
//!
//! Sessions run inside a `session` span; the local engine's streaming
//! thread runs inside a `streaming` span.

mod metrics;
mod tracing_support;

pub use self::metrics::{
    SessionMetrics, init_metrics, record_event, record_feedback_dropped, record_lifecycle,
};
pub use self::tracing_support::{instrument_session, span_element, span_session, span_streaming};
