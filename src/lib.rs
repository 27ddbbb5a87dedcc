//! # graphbridge
//!
//! Glue between an RTP/RTCP packet transport and a media-processing graph.
//!
//! The bridge moves encoded packets into the graph through a pull callback,
//! carries feedback packets (RTCP receiver reports) out through a push
//! callback, intercepts pad events at the graph's boundary pads, and turns
//! the graph's bus into a short list of lifecycle events.
//!
//! ## Features
//!
//! - **Non-blocking adapters**: bounded pulls, partial-write aware pushes
//! - **Event policies**: forward, drop or rewrite pad events; EOS and
//!   flushes always get through
//! - **One teardown path**: liveness flag first, graph to `Null`, then
//!   detach and release
//! - **Engine seam**: everything goes through [`engine::GraphEngine`];
//!   [`engine::local::LocalEngine`] runs graphs in-process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graphbridge::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> graphbridge::Result<()> {
//! let engine = LocalEngine::from_description(
//!     "packetsrc name=media ! rtcpreporter feedback=fb ! appsink name=out ; \
//!      packetsrc name=rtcp-in ! feedbacksink name=fb",
//! )?;
//! let mut session = Session::new(engine, SessionConfig::new("call-1"))?;
//!
//! let (transport, packets) = ChannelTransport::new();
//! session.attach_source("media", transport)?;
//! let (writer, feedback) = ChannelWriter::unbounded();
//! session.attach_feedback_sink("fb", writer)?;
//!
//! session.play()?;
//! while let Some(event) = session.poll_event(Duration::from_millis(100)) {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! session.teardown()?;
//! # drop((packets, feedback));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod caps;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod interceptor;
pub mod liveness;
pub mod monitor;
pub mod observability;
pub mod packet;
pub mod property;
pub mod rtcp;
pub mod session;
pub mod sink;
pub mod source;
pub mod transcode;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::caps::{Caps, RtpCodecParameters};
    pub use crate::config::{EngineConfig, MonitorConfig, SessionConfig, SinkConfig, SourceConfig};
    pub use crate::engine::local::LocalEngine;
    pub use crate::engine::{
        GraphEngine, GraphState, PadDirection, PadRef, ProbeReturn, StateChange,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::PadEvent;
    pub use crate::interceptor::{EventPolicy, PadEventInterceptor};
    pub use crate::monitor::{LifecycleEvent, LifecycleMonitor};
    pub use crate::property::{ElementHandle, ElementProperties};
    pub use crate::session::Session;
    pub use crate::sink::{ChannelWriter, FeedbackSink, PacketWriter};
    pub use crate::source::{ChannelTransport, PacketReader, PacketSource};
}

pub use error::{Error, Result};
