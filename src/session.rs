//! Session: one graph, its adapters, and a single teardown path.
//!
//! A [`Session`] owns the graph through a [`GraphHandle`], installs the
//! packet source, feedback sink and pad interceptors on it, and exposes the
//! [`LifecycleMonitor`]. Teardown runs in a fixed order:
//!
//! 1. flip the liveness flag and close every source transport, then wait
//!    for callbacks already inside to return
//! 2. drive the graph to `Null`
//! 3. detach callbacks and probes, release the handle, mark the flag dead
//!
//! Teardown is idempotent and also runs on drop.

use crate::config::SessionConfig;
use crate::engine::{
    ElementId, GraphEngine, GraphState, PadDirection, PadProbe, PadRef, ProbeId, PropertyType,
    PropertyValue, PullHandler, PushHandler, StateChange,
};
use crate::error::{Error, Result};
use crate::interceptor::{EventPolicy, PadEventInterceptor};
use crate::liveness::Liveness;
use crate::monitor::{LifecycleEvent, LifecycleMonitor};
use crate::observability::{SessionMetrics, record_lifecycle, span_session};
use crate::property::{ElementHandle, ElementProperties};
use crate::sink::{FeedbackSink, PacketWriter};
use crate::source::{PacketReader, PacketSource};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Graph handle
// ============================================================================

/// Owner of the engine. Released exactly once.
pub struct GraphHandle<E: GraphEngine> {
    engine: Option<Arc<E>>,
}

impl<E: GraphEngine> GraphHandle<E> {
    /// Take ownership of an engine.
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    /// The engine, unless released.
    pub fn get(&self) -> Result<&Arc<E>> {
        self.engine.as_ref().ok_or(Error::HandleReleased)
    }

    /// Whether [`release`](Self::release) ran.
    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }

    /// Drop the engine. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        self.engine.take().is_some()
    }
}

// ============================================================================
// Session
// ============================================================================

trait TransportControl: Send + Sync {
    fn close_transport(&self);
    fn end_stream(&self);
}

impl<R: PacketReader> TransportControl for PacketSource<R> {
    fn close_transport(&self) {
        PacketSource::close_transport(self);
    }

    fn end_stream(&self) {
        PacketSource::end_stream(self);
    }
}

/// One bridged graph.
pub struct Session<E: GraphEngine> {
    config: SessionConfig,
    handle: GraphHandle<E>,
    liveness: Liveness,
    metrics: SessionMetrics,
    monitor: LifecycleMonitor<E>,
    span: tracing::Span,
    sources: Vec<(ElementId, Arc<dyn TransportControl>)>,
    sinks: Vec<ElementId>,
    probes: Vec<ProbeId>,
    torn_down: bool,
}

impl<E: GraphEngine> Session<E> {
    /// Wrap an engine.
    pub fn new(engine: E, config: SessionConfig) -> Result<Self> {
        Self::from_arc(Arc::new(engine), config)
    }

    /// Wrap an engine the caller already shares.
    ///
    /// The graph is only released once every other strong reference is
    /// gone; the session stops using it at teardown either way.
    pub fn from_arc(engine: Arc<E>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let monitor = LifecycleMonitor::new(&engine, config.name.clone(), config.monitor.clone());
        let span = span_session(&config.name);
        tracing::debug!(parent: &span, "session created");
        Ok(Self {
            metrics: SessionMetrics::new(&config.name),
            handle: GraphHandle::new(engine),
            liveness: Liveness::new(),
            monitor,
            span,
            sources: Vec::new(),
            sinks: Vec::new(),
            probes: Vec::new(),
            torn_down: false,
            config,
        })
    }

    /// Session name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The engine, unless released.
    pub fn engine(&self) -> Result<&Arc<E>> {
        self.handle.get()
    }

    /// Liveness flag shared with every adapter of this session.
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Lifecycle monitor.
    pub fn monitor(&self) -> &LifecycleMonitor<E> {
        &self.monitor
    }

    /// Whether teardown ran.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn live_engine(&self) -> Result<&Arc<E>> {
        if self.torn_down || !self.liveness.is_live() {
            return Err(Error::LifecycleViolation(format!(
                "session '{}' is tearing down",
                self.config.name
            )));
        }
        self.handle.get()
    }

    /// Install a packet source on the named source element.
    pub fn attach_source<R: PacketReader + 'static>(
        &mut self,
        element: &str,
        reader: R,
    ) -> Result<Arc<PacketSource<R>>> {
        let engine = self.live_engine()?;
        let id = engine.element_by_name(element)?;
        let source = Arc::new(PacketSource::new(
            reader,
            self.config.source.clone(),
            self.liveness.clone(),
            self.metrics.clone(),
        ));
        engine.set_pull_handler(id, Some(Arc::clone(&source) as Arc<dyn PullHandler>))?;
        self.sources.push((id, Arc::clone(&source) as Arc<dyn TransportControl>));
        tracing::debug!(parent: &self.span, element, "packet source attached");
        Ok(source)
    }

    /// Install a feedback sink on the named sink element.
    ///
    /// The element's `max-retries` property, when it has one, is set from
    /// [`SinkConfig::max_retries`](crate::config::SinkConfig::max_retries).
    pub fn attach_feedback_sink<W: PacketWriter + 'static>(
        &mut self,
        element: &str,
        writer: W,
    ) -> Result<Arc<FeedbackSink<W>>> {
        let engine = self.live_engine()?;
        let id = engine.element_by_name(element)?;
        if let Ok(PropertyType::Int64) = engine.property_type(id, "max-retries") {
            engine.set_property(
                id,
                "max-retries",
                PropertyValue::Int64(i64::from(self.config.sink.max_retries)),
            )?;
        }
        let sink = Arc::new(FeedbackSink::new(
            writer,
            self.liveness.clone(),
            self.metrics.clone(),
        ));
        engine.set_push_handler(id, Some(Arc::clone(&sink) as Arc<dyn PushHandler>))?;
        self.sinks.push(id);
        tracing::debug!(parent: &self.span, element, "feedback sink attached");
        Ok(sink)
    }

    /// Attach an interceptor running `policy` to a pad.
    pub fn attach_interceptor(
        &mut self,
        pad: PadRef,
        policy: impl EventPolicy + 'static,
    ) -> Result<Arc<PadEventInterceptor>> {
        let engine = self.live_engine()?;
        let label = format!("{}.{}", engine.element_name(pad.element)?, pad.direction);
        let interceptor = Arc::new(PadEventInterceptor::new(
            self.config.name.clone(),
            label,
            policy,
            self.liveness.clone(),
        ));
        let id = engine.add_pad_probe(pad, Arc::clone(&interceptor) as Arc<dyn PadProbe>)?;
        self.probes.push(id);
        tracing::debug!(parent: &self.span, pad = %interceptor.label(), "interceptor attached");
        Ok(interceptor)
    }

    /// Attach an interceptor to a pad of the named element.
    pub fn intercept(
        &mut self,
        element: &str,
        direction: PadDirection,
        policy: impl EventPolicy + 'static,
    ) -> Result<Arc<PadEventInterceptor>> {
        let id = self.live_engine()?.element_by_name(element)?;
        self.attach_interceptor(PadRef { element: id, direction }, policy)
    }

    /// Typed property accessors for this session's graph.
    pub fn properties(&self) -> Result<ElementProperties<E>> {
        Ok(ElementProperties::new(self.handle.get()?))
    }

    /// Look up an element.
    pub fn element(&self, name: &str) -> Result<ElementHandle<E>> {
        ElementHandle::lookup(self.handle.get()?, name)
    }

    /// Request a state change.
    pub fn set_state(&self, target: GraphState) -> Result<StateChange> {
        self.live_engine()?;
        self.monitor.request_state(target)
    }

    /// Start streaming.
    pub fn play(&self) -> Result<StateChange> {
        self.set_state(GraphState::Playing)
    }

    /// Wait up to `timeout` for the next lifecycle event.
    pub fn poll_event(&self, timeout: Duration) -> Option<LifecycleEvent> {
        self.monitor.poll(timeout)
    }

    /// Wait for the next lifecycle event from an async context.
    pub async fn next_event(&self) -> Result<LifecycleEvent> {
        self.monitor.next_event().await
    }

    /// Tell every attached source that no more packets will come.
    pub fn end_stream(&self) {
        for (_, source) in &self.sources {
            source.end_stream();
        }
    }

    /// Tear the session down. Later calls do nothing.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let span = self.span.clone();
        let _entered = span.enter();
        tracing::debug!("teardown started");

        self.liveness.begin_teardown();
        for (_, source) in &self.sources {
            source.close_transport();
        }
        if !self.liveness.wait_idle(self.config.monitor.teardown_timeout) {
            tracing::warn!(
                in_flight = self.liveness.in_flight(),
                "callbacks still running after teardown timeout"
            );
        }

        let mut result = Ok(());
        if let Ok(engine) = self.handle.get() {
            if let Err(e) = self.stop_graph(engine) {
                tracing::error!(error = %e, "graph did not reach NULL");
                result = Err(e);
            }
            for (id, _) in &self.sources {
                if let Err(e) = engine.set_pull_handler(*id, None) {
                    tracing::debug!(error = %e, "clearing pull callback");
                }
            }
            for id in &self.sinks {
                if let Err(e) = engine.set_push_handler(*id, None) {
                    tracing::debug!(error = %e, "clearing push callback");
                }
            }
            for probe in &self.probes {
                if let Err(e) = engine.remove_pad_probe(*probe) {
                    tracing::debug!(error = %e, "removing probe");
                }
            }
        }
        self.sources.clear();
        self.sinks.clear();
        self.probes.clear();

        self.handle.release();
        self.liveness.mark_dead();
        record_lifecycle(&self.config.name, "teardown");
        tracing::debug!(rejected = self.liveness.rejected(), "teardown finished");
        result
    }

    fn stop_graph(&self, engine: &Arc<E>) -> Result<()> {
        match engine.set_state(GraphState::Null)? {
            StateChange::Success => Ok(()),
            StateChange::Failure => Err(Error::LifecycleViolation(
                "graph refused to reach NULL".into(),
            )),
            StateChange::Async => {
                let deadline = Instant::now() + self.config.monitor.teardown_timeout;
                while engine.current_state() != GraphState::Null {
                    if Instant::now() >= deadline {
                        return Err(Error::LifecycleViolation(format!(
                            "graph still {} after {:?}",
                            engine.current_state(),
                            self.config.monitor.teardown_timeout
                        )));
                    }
                    std::thread::sleep(self.config.monitor.poll_interval);
                }
                Ok(())
            }
        }
    }
}

impl<E: GraphEngine> Drop for Session<E> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(session = %self.config.name, error = %e, "teardown on drop failed");
        }
    }
}

impl<E: GraphEngine> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("liveness", &self.liveness)
            .field("sources", &self.sources.len())
            .field("sinks", &self.sinks.len())
            .field("probes", &self.probes.len())
            .field("released", &self.handle.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalEngine;
    use crate::interceptor::ForwardAll;
    use crate::sink::ChannelWriter;
    use crate::source::ChannelTransport;

    const DESC: &str = "packetsrc name=media ! appsink name=out ; packetsrc name=rtcp-in ! feedbacksink name=fb";

    #[test]
    fn test_attach_and_teardown() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        let mut session = Session::new(engine, SessionConfig::new("call-1")).unwrap();

        let (transport, _tx) = ChannelTransport::new();
        let source = session.attach_source("media", transport).unwrap();
        let (writer, _rx) = ChannelWriter::unbounded();
        session.attach_feedback_sink("fb", writer).unwrap();
        let interceptor = session
            .intercept("out", PadDirection::Sink, ForwardAll::new())
            .unwrap();
        assert_eq!(interceptor.label(), "out.sink");

        let engine = Arc::clone(session.engine().unwrap());
        let fb = engine.element_by_name("fb").unwrap();
        assert!(matches!(
            engine.get_property(fb, "max-retries").unwrap(),
            PropertyValue::Int64(3)
        ));

        session.teardown().unwrap();
        assert!(session.is_torn_down());
        assert!(matches!(session.engine(), Err(Error::HandleReleased)));
        assert!(matches!(
            session.attach_source("media", ChannelTransport::new().0),
            Err(Error::LifecycleViolation(_))
        ));
        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), crate::engine::PullResult::EndOfStream);
        assert!(source.stats().rejected >= 1);
        session.teardown().unwrap();
    }

    #[test]
    fn test_unknown_elements() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        let mut session = Session::new(engine, SessionConfig::new("call-2")).unwrap();
        let (writer, _rx) = ChannelWriter::unbounded();
        assert!(matches!(
            session.attach_feedback_sink("nope", writer),
            Err(Error::UnknownElement(_))
        ));
        let (writer, _rx) = ChannelWriter::unbounded();
        assert!(matches!(
            session.attach_feedback_sink("out", writer),
            Err(Error::Element(_))
        ));
    }

    #[test]
    fn test_invalid_config() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        assert!(matches!(
            Session::new(engine, SessionConfig::new("")),
            Err(Error::Config(_))
        ));
    }
}
