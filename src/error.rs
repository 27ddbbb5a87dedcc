//! Error types for graphbridge.
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped by [`ErrorCategory`] so hosts can decide whether a failure is
//! local to an adapter, a rejected call, or terminal for the session.

use crate::engine::{GraphState, PropertyType};
use thiserror::Error;

/// Result type alias using graphbridge's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for graphbridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A pull or push timed out or transferred only part of a packet.
    #[error("transient I/O: {0}")]
    TransientIo(String),

    /// Malformed pad event or media capability string.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The property name is not registered on the element.
    #[error("unknown property '{property}' on element '{element}'")]
    UnknownProperty {
        /// Element the lookup was made on.
        element: String,
        /// Requested property name.
        property: String,
    },

    /// The accessor used does not match the registered property type.
    #[error("type mismatch for property '{property}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Property name.
        property: String,
        /// Type the accessor works with.
        expected: PropertyType,
        /// Type registered on the element.
        found: PropertyType,
    },

    /// The property exists but cannot be written.
    #[error("property '{property}' on element '{element}' is not writable")]
    ReadOnlyProperty {
        /// Element name.
        element: String,
        /// Property name.
        property: String,
    },

    /// The engine reported an ERROR message. Terminal for the session.
    #[error("fatal graph error in {element}: {message}")]
    FatalGraph {
        /// Name of the element that posted the error.
        element: String,
        /// Diagnostic message.
        message: String,
    },

    /// An operation arrived after teardown began, or out of lifecycle order.
    #[error("lifecycle violation: {0}")]
    LifecycleViolation(String),

    /// The requested state change is not allowed from the current state.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Current state.
        from: GraphState,
        /// Requested state.
        to: GraphState,
    },

    /// The graph handle was already released by teardown.
    #[error("graph handle already released")]
    HandleReleased,

    /// No element with this name or id exists in the graph.
    #[error("unknown element: {0}")]
    UnknownElement(String),

    /// The graph description could not be parsed or instantiated.
    #[error("invalid graph description: {0}")]
    InvalidDescription(String),

    /// Element-level failure while processing data.
    #[error("element error: {0}")]
    Element(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Adapter-local, retried by the caller. Never surfaces on the bus.
    Transient,
    /// Logged; the offending event is dropped or the call fails. Session continues.
    Protocol,
    /// Session must be torn down.
    Fatal,
    /// Raised after teardown began. Detected and ignored by callbacks.
    Lifecycle,
    /// Caller misuse (unknown names, bad configuration).
    Usage,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::TransientIo(_) => ErrorCategory::Transient,
            Error::Protocol(_)
            | Error::UnknownProperty { .. }
            | Error::TypeMismatch { .. }
            | Error::ReadOnlyProperty { .. } => ErrorCategory::Protocol,
            Error::FatalGraph { .. } | Error::Element(_) | Error::Io(_) => ErrorCategory::Fatal,
            Error::LifecycleViolation(_)
            | Error::HandleReleased
            | Error::InvalidStateTransition { .. } => ErrorCategory::Lifecycle,
            Error::UnknownElement(_) | Error::InvalidDescription(_) | Error::Config(_) => {
                ErrorCategory::Usage
            }
        }
    }

    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        self.category() != ErrorCategory::Fatal
    }
}
