//! Spans for sessions and graph elements.

use tracing::{Level, Span, span};

/// Create a span covering one bridge session.
///
/// ```rust,ignore
/// let span = span_session("call-7");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_session(name: &str) -> Span {
    span!(Level::INFO, "session", name = %name)
}

/// Create a span for work done on behalf of one element.
#[inline]
pub fn span_element(session: &str, element: &str, factory: &str) -> Span {
    span!(
        Level::DEBUG,
        "element",
        session = %session,
        element = %element,
        factory = %factory
    )
}

/// Create a span for the engine's streaming thread.
#[inline]
pub fn span_streaming(graph: &str) -> Span {
    span!(Level::DEBUG, "streaming", graph = %graph)
}

/// Enter a session span for the lifetime of the returned guard.
#[inline]
pub fn instrument_session(name: &str) -> tracing::span::EnteredSpan {
    span_session(name).entered()
}
