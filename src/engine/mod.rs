//! The graph engine contract.
//!
//! The bridge never reaches into a media framework directly. Everything it
//! needs from the engine is expressed by [`GraphEngine`]: element lookup,
//! state changes, the bus, pull/push callback slots, pad probes, typed
//! properties, and event injection.
//!
//! Callbacks registered through this trait are invoked *by the engine* on
//! its own streaming thread(s):
//!
//! - [`PullHandler::pull`] when a source element needs input
//! - [`PushHandler::push`] when a sink element emits a feedback packet
//! - [`PadProbe::on_event`] for every event crossing a probed pad
//!
//! [`local::LocalEngine`] is an in-process implementation of the contract.

pub mod local;
pub mod parser;

use crate::error::Result;
use crate::event::PadEvent;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of an element inside one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

impl ElementId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Direction of a pad relative to its element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// Output pad: data leaves the element here.
    Source,
    /// Input pad: data enters the element here.
    Sink,
}

impl fmt::Display for PadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PadDirection::Source => f.write_str("src"),
            PadDirection::Sink => f.write_str("sink"),
        }
    }
}

/// Reference to one pad of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PadRef {
    /// Owning element.
    pub element: ElementId,
    /// Which pad.
    pub direction: PadDirection,
}

impl PadRef {
    /// The element's source pad.
    pub fn src(element: ElementId) -> Self {
        Self {
            element,
            direction: PadDirection::Source,
        }
    }

    /// The element's sink pad.
    pub fn sink(element: ElementId) -> Self {
        Self {
            element,
            direction: PadDirection::Sink,
        }
    }
}

/// Identifier returned by [`GraphEngine::add_pad_probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub(crate) u64);

// ============================================================================
// States
// ============================================================================

/// Graph state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum GraphState {
    /// No resources allocated.
    #[default]
    Null,
    /// Resources allocated, no data flowing.
    Ready,
    /// Prerolled, clock stopped.
    Paused,
    /// Data flowing.
    Playing,
}

impl GraphState {
    /// The adjacent state one step toward `target`, or `None` when already there.
    pub fn step_toward(self, target: GraphState) -> Option<GraphState> {
        use GraphState::*;
        let next = match self.cmp(&target) {
            std::cmp::Ordering::Equal => return None,
            std::cmp::Ordering::Less => match self {
                Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            },
            std::cmp::Ordering::Greater => match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null => Null,
            },
        };
        Some(next)
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphState::Null => "NULL",
            GraphState::Ready => "READY",
            GraphState::Paused => "PAUSED",
            GraphState::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The graph is in the requested state.
    Success,
    /// The change completes later; a `StateChanged` bus message follows.
    Async,
    /// The change failed; an `Error` bus message usually follows.
    Failure,
}

// ============================================================================
// Bus messages
// ============================================================================

/// Messages the engine posts on its bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// Every sink reached end of stream.
    Eos {
        /// Posting element or `"pipeline"`.
        source: String,
    },
    /// Fatal error.
    Error {
        /// Posting element.
        source: String,
        /// Diagnostic message.
        message: String,
        /// Extra detail for logs.
        debug: Option<String>,
    },
    /// Non-fatal problem.
    Warning {
        /// Posting element.
        source: String,
        /// Diagnostic message.
        message: String,
        /// Set when data was lost and the session is running degraded.
        degraded: bool,
    },
    /// Informational message.
    Info {
        /// Posting element.
        source: String,
        /// Message text.
        message: String,
    },
    /// A state change finished.
    StateChanged {
        /// Posting element or `"pipeline"`.
        source: String,
        /// Previous state.
        old: GraphState,
        /// New state.
        new: GraphState,
        /// Still pending target, `None` once settled.
        pending: Option<GraphState>,
    },
    /// Element-specific structured message.
    Element {
        /// Posting element.
        source: String,
        /// Structure name.
        name: String,
        /// Structure fields.
        fields: Vec<(String, String)>,
    },
}

/// Source name used for graph-level messages.
pub const PIPELINE_SOURCE: &str = "pipeline";

impl BusMessage {
    /// Name of the posting element.
    pub fn source(&self) -> &str {
        match self {
            BusMessage::Eos { source }
            | BusMessage::Error { source, .. }
            | BusMessage::Warning { source, .. }
            | BusMessage::Info { source, .. }
            | BusMessage::StateChanged { source, .. }
            | BusMessage::Element { source, .. } => source,
        }
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusMessage::Eos { source } => write!(f, "EOS from {source}"),
            BusMessage::Error {
                source, message, ..
            } => write!(f, "ERROR from {source}: {message}"),
            BusMessage::Warning {
                source, message, ..
            } => write!(f, "WARNING from {source}: {message}"),
            BusMessage::Info { source, message } => write!(f, "INFO from {source}: {message}"),
            BusMessage::StateChanged {
                source, old, new, ..
            } => write!(f, "{source} state changed {old} -> {new}"),
            BusMessage::Element { source, name, .. } => write!(f, "{source} posted {name}"),
        }
    }
}

// ============================================================================
// Callback contracts
// ============================================================================

/// Result of a pull callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullResult {
    /// Bytes written into the buffer; zero means "nothing yet".
    Data(usize),
    /// No more data will ever come; the engine drains and posts EOS.
    EndOfStream,
    /// Local hiccup; the engine retries on its next iteration.
    Transient,
}

/// Result of a push callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// Bytes forwarded to the transport, possibly fewer than offered.
    Accepted(usize),
    /// Nothing was forwarded.
    Error,
}

/// Decision of a pad probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeReturn {
    /// Let the event continue unchanged.
    Forward,
    /// Stop the event here.
    Drop,
    /// Continue with a different event.
    Replace(PadEvent),
}

/// Supplies input to a source element.
///
/// Must return within a bounded time; `into` is only valid for the call.
pub trait PullHandler: Send + Sync {
    /// Fill `into` with at most one packet.
    fn pull(&self, into: &mut [u8]) -> PullResult;
}

/// Receives feedback packets from a sink element.
pub trait PushHandler: Send + Sync {
    /// Forward `from` to the transport. `from` is only valid for the call.
    fn push(&self, from: &[u8]) -> PushResult;
}

/// Observes events crossing a pad. Runs inline on the streaming thread.
pub trait PadProbe: Send + Sync {
    /// Decide what happens to `event`.
    fn on_event(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn;
}

// ============================================================================
// Properties
// ============================================================================

/// Opaque host value stored in an element property.
pub type Opaque = Arc<dyn Any + Send + Sync>;

/// Registered type of an element property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Int64,
    /// Boolean.
    Bool,
    /// Double-precision float.
    Double,
    /// Opaque host pointer.
    Opaque,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::String => "string",
            PropertyType::Int64 => "int64",
            PropertyType::Bool => "bool",
            PropertyType::Double => "double",
            PropertyType::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// A typed property value.
#[derive(Clone)]
pub enum PropertyValue {
    /// String value.
    String(String),
    /// Integer value.
    Int64(i64),
    /// Boolean value.
    Bool(bool),
    /// Float value.
    Double(f64),
    /// Opaque value, `None` when unset.
    Opaque(Option<Opaque>),
}

impl PropertyValue {
    /// Type of this value.
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Int64(_) => PropertyType::Int64,
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::Opaque(_) => PropertyType::Opaque,
        }
    }

    /// Default value for a type.
    pub fn default_for(ty: PropertyType) -> Self {
        match ty {
            PropertyType::String => PropertyValue::String(String::new()),
            PropertyType::Int64 => PropertyValue::Int64(0),
            PropertyType::Bool => PropertyValue::Bool(false),
            PropertyType::Double => PropertyValue::Double(0.0),
            PropertyType::Opaque => PropertyValue::Opaque(None),
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => f.debug_tuple("String").field(s).finish(),
            PropertyValue::Int64(i) => f.debug_tuple("Int64").field(i).finish(),
            PropertyValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            PropertyValue::Double(d) => f.debug_tuple("Double").field(d).finish(),
            PropertyValue::Opaque(Some(_)) => f.write_str("Opaque(..)"),
            PropertyValue::Opaque(None) => f.write_str("Opaque(None)"),
        }
    }
}

// ============================================================================
// Engine trait
// ============================================================================

/// Operations the bridge needs from a graph engine.
///
/// Implementations serialize mutators internally; the bridge adds no
/// locking of its own around these calls.
pub trait GraphEngine: Send + Sync + 'static {
    /// Look up an element by name.
    fn element_by_name(&self, name: &str) -> Result<ElementId>;

    /// Name of an element.
    fn element_name(&self, element: ElementId) -> Result<String>;

    /// Request a state change.
    fn set_state(&self, state: GraphState) -> Result<StateChange>;

    /// Current settled state.
    fn current_state(&self) -> GraphState;

    /// Wait up to `timeout` for the next bus message.
    fn pop_bus_message(&self, timeout: Duration) -> Option<BusMessage>;

    /// Install or clear the pull callback of a source element.
    fn set_pull_handler(
        &self,
        element: ElementId,
        handler: Option<Arc<dyn PullHandler>>,
    ) -> Result<()>;

    /// Install or clear the push callback of a sink element.
    fn set_push_handler(
        &self,
        element: ElementId,
        handler: Option<Arc<dyn PushHandler>>,
    ) -> Result<()>;

    /// Attach an event probe to a pad.
    fn add_pad_probe(&self, pad: PadRef, probe: Arc<dyn PadProbe>) -> Result<ProbeId>;

    /// Detach a probe. Removing an unknown id is a no-op.
    fn remove_pad_probe(&self, probe: ProbeId) -> Result<()>;

    /// Registered type of a property.
    fn property_type(&self, element: ElementId, name: &str) -> Result<PropertyType>;

    /// Read a property.
    fn get_property(&self, element: ElementId, name: &str) -> Result<PropertyValue>;

    /// Write a property. The value type must match the registered type.
    fn set_property(&self, element: ElementId, name: &str, value: PropertyValue) -> Result<()>;

    /// Inject an event at a pad. Returns whether it was queued.
    fn send_event(&self, pad: PadRef, event: PadEvent) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_toward() {
        use GraphState::*;
        assert_eq!(Null.step_toward(Playing), Some(Ready));
        assert_eq!(Ready.step_toward(Playing), Some(Paused));
        assert_eq!(Paused.step_toward(Playing), Some(Playing));
        assert_eq!(Playing.step_toward(Null), Some(Paused));
        assert_eq!(Ready.step_toward(Null), Some(Null));
        assert_eq!(Paused.step_toward(Paused), None);
    }

    #[test]
    fn test_property_value_types() {
        assert_eq!(
            PropertyValue::String("x".into()).property_type(),
            PropertyType::String
        );
        let opaque: Opaque = Arc::new(42u32);
        assert_eq!(
            PropertyValue::Opaque(Some(opaque)).property_type(),
            PropertyType::Opaque
        );
        assert!(matches!(
            PropertyValue::default_for(PropertyType::Int64),
            PropertyValue::Int64(0)
        ));
    }

    #[test]
    fn test_bus_message_display() {
        let msg = BusMessage::StateChanged {
            source: PIPELINE_SOURCE.into(),
            old: GraphState::Paused,
            new: GraphState::Playing,
            pending: None,
        };
        assert_eq!(msg.to_string(), "pipeline state changed PAUSED -> PLAYING");
        assert_eq!(msg.source(), "pipeline");
    }
}
