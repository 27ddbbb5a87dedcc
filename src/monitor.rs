//! Lifecycle and bus monitor.
//!
//! [`LifecycleMonitor`] drives the graph's state machine and turns raw bus
//! messages into the few events a host cares about:
//!
//! | Bus message | Lifecycle event |
//! |-------------|-----------------|
//! | `Eos` | [`LifecycleEvent::EndOfStream`] |
//! | `Error` | [`LifecycleEvent::Error`] |
//! | `StateChanged` settling a pending async change | [`LifecycleEvent::StateChangeComplete`] |
//! | `Warning` | none; logged, and `degraded` ones set [`LifecycleMonitor::is_degraded`] |
//!
//! The first `EndOfStream` or `Error` is terminal and delivered once. After
//! an error, only transitions toward `Null` are accepted.

use crate::config::MonitorConfig;
use crate::engine::{BusMessage, GraphEngine, GraphState, StateChange};
use crate::error::{Error, Result};
use crate::observability::record_lifecycle;
use futures::Stream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Host-visible lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Every sink reached end of stream.
    EndOfStream,
    /// The graph failed. Terminal.
    Error {
        /// Diagnostic message.
        message: String,
        /// Extra detail.
        debug: Option<String>,
        /// Element that posted the error.
        source: String,
    },
    /// An asynchronous state change finished.
    StateChangeComplete(GraphState),
}

impl LifecycleEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleEvent::StateChangeComplete(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::EndOfStream => "eos",
            LifecycleEvent::Error { .. } => "error",
            LifecycleEvent::StateChangeComplete(_) => "state-change-complete",
        }
    }
}

#[derive(Debug, Default)]
struct Tracking {
    pending: Option<GraphState>,
    terminal_delivered: bool,
    failed: bool,
}

/// Translates bus traffic of one engine into [`LifecycleEvent`]s.
///
/// Holds the engine weakly; once the session released its handle every
/// call fails with [`Error::HandleReleased`] (or yields nothing, for polls).
pub struct LifecycleMonitor<E: GraphEngine> {
    engine: Weak<E>,
    session: String,
    config: MonitorConfig,
    tracking: Mutex<Tracking>,
    degraded: AtomicBool,
    warnings: AtomicU64,
}

impl<E: GraphEngine> LifecycleMonitor<E> {
    /// Create a monitor for `engine`.
    pub fn new(engine: &Arc<E>, session: impl Into<String>, config: MonitorConfig) -> Self {
        Self {
            engine: Arc::downgrade(engine),
            session: session.into(),
            config,
            tracking: Mutex::new(Tracking::default()),
            degraded: AtomicBool::new(false),
            warnings: AtomicU64::new(0),
        }
    }

    fn engine(&self) -> Result<Arc<E>> {
        self.engine.upgrade().ok_or(Error::HandleReleased)
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session name.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Current settled state of the graph, `Null` once released.
    pub fn current_state(&self) -> GraphState {
        self.engine
            .upgrade()
            .map_or(GraphState::Null, |engine| engine.current_state())
    }

    /// Target of an asynchronous change still in progress.
    pub fn pending_state(&self) -> Option<GraphState> {
        self.tracking().pending
    }

    /// Whether a fatal error was seen.
    pub fn has_failed(&self) -> bool {
        self.tracking().failed
    }

    /// Whether the terminal event was delivered.
    pub fn is_terminated(&self) -> bool {
        self.tracking().terminal_delivered
    }

    /// Whether feedback data was lost and the session runs degraded.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Warnings seen so far.
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Ask the engine to move to `target`.
    ///
    /// After a fatal error only targets at or below the current state are
    /// accepted.
    ///
    /// The target is pending before the engine is called, so a completion
    /// posted while `set_state` is still running is not lost to a
    /// concurrent [`poll`](Self::poll).
    pub fn request_state(&self, target: GraphState) -> Result<StateChange> {
        let engine = self.engine()?;
        let current = engine.current_state();
        if self.has_failed() && target > current {
            return Err(Error::LifecycleViolation(format!(
                "{target} requested after a fatal error (graph is {current})"
            )));
        }

        self.tracking().pending = Some(target);
        let result = engine.set_state(target);
        let mut tracking = self.tracking();
        match &result {
            Ok(StateChange::Async) => {}
            Ok(StateChange::Success | StateChange::Failure) | Err(_) => {
                if tracking.pending == Some(target) {
                    tracking.pending = None;
                }
            }
        }
        drop(tracking);

        let result = result?;
        tracing::debug!(
            session = %self.session,
            from = %current,
            to = %target,
            result = ?result,
            "state change requested"
        );
        Ok(result)
    }

    /// Wait up to `timeout` for the next lifecycle event.
    ///
    /// Bus messages that translate to nothing are consumed along the way.
    pub fn poll(&self, timeout: Duration) -> Option<LifecycleEvent> {
        let engine = self.engine.upgrade()?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = engine.pop_bus_message(remaining)?;
            if let Some(event) = self.translate(message) {
                record_lifecycle(&self.session, event.kind());
                return Some(event);
            }
        }
    }

    fn translate(&self, message: BusMessage) -> Option<LifecycleEvent> {
        match message {
            BusMessage::Eos { source } => {
                let mut tracking = self.tracking();
                if tracking.terminal_delivered {
                    tracing::debug!(
                        session = %self.session,
                        %source,
                        "EOS after terminal event; ignoring"
                    );
                    return None;
                }
                tracking.terminal_delivered = true;
                tracing::debug!(session = %self.session, "end of stream");
                Some(LifecycleEvent::EndOfStream)
            }
            BusMessage::Error {
                source,
                message,
                debug,
            } => {
                let mut tracking = self.tracking();
                tracking.failed = true;
                if tracking.terminal_delivered {
                    tracing::debug!(
                        session = %self.session,
                        %source,
                        %message,
                        "error after terminal event; ignoring"
                    );
                    return None;
                }
                tracking.terminal_delivered = true;
                let detail = debug.as_deref().unwrap_or("");
                tracing::error!(
                    session = %self.session,
                    element = %source,
                    %message,
                    detail,
                    "graph error"
                );
                Some(LifecycleEvent::Error {
                    message,
                    debug,
                    source,
                })
            }
            BusMessage::Warning {
                source,
                message,
                degraded,
            } => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
                if degraded && !self.degraded.swap(true, Ordering::SeqCst) {
                    record_lifecycle(&self.session, "degraded");
                }
                tracing::warn!(session = %self.session, element = %source, degraded, "{message}");
                None
            }
            BusMessage::StateChanged {
                new,
                pending: None,
                ..
            } => {
                let mut tracking = self.tracking();
                if tracking.pending == Some(new) {
                    tracking.pending = None;
                    Some(LifecycleEvent::StateChangeComplete(new))
                } else {
                    None
                }
            }
            other => {
                tracing::trace!(session = %self.session, message = %other, "bus");
                None
            }
        }
    }

    /// Wait for the next lifecycle event from an async context.
    ///
    /// Polls the bus every [`MonitorConfig::poll_interval`]. Fails with
    /// [`Error::HandleReleased`] once the engine is gone.
    pub async fn next_event(&self) -> Result<LifecycleEvent> {
        loop {
            if let Some(event) = self.poll(Duration::ZERO) {
                return Ok(event);
            }
            if self.engine.strong_count() == 0 {
                return Err(Error::HandleReleased);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Wait for EOS or an error.
    ///
    /// `Ok(())` on end of stream, [`Error::FatalGraph`] on error.
    pub async fn wait_terminal(&self) -> Result<()> {
        loop {
            match self.next_event().await? {
                LifecycleEvent::EndOfStream => return Ok(()),
                LifecycleEvent::Error {
                    message, source, ..
                } => {
                    return Err(Error::FatalGraph {
                        element: source,
                        message,
                    });
                }
                LifecycleEvent::StateChangeComplete(_) => continue,
            }
        }
    }

    /// Lifecycle events as a stream. Ends when the engine is released.
    pub fn events(&self) -> impl Stream<Item = LifecycleEvent> + '_ {
        futures::stream::unfold(self, |monitor| async move {
            monitor.next_event().await.ok().map(|event| (event, monitor))
        })
    }
}

impl<E: GraphEngine> std::fmt::Debug for LifecycleMonitor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracking = self.tracking();
        f.debug_struct("LifecycleMonitor")
            .field("session", &self.session)
            .field("pending", &tracking.pending)
            .field("failed", &tracking.failed)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
