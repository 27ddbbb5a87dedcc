//! Pad events.
//!
//! Events are out-of-band signals that cross pads alongside packets. Most
//! flow downstream with the data (stream-start, segment, caps, EOS); a few
//! flow upstream against it (force-key-unit). Flush events travel either
//! way.
//!
//! EOS and both flush events are *mandatory*: teardown of everything
//! downstream depends on them, so an interceptor can delay or observe them
//! but never discard them (see [`PadEvent::is_mandatory`]).

use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::error::{Error, Result};

// ============================================================================
// Event Enum
// ============================================================================

/// Events that cross a pad.
#[derive(Debug, Clone, PartialEq)]
pub enum PadEvent {
    // ========== Downstream Events ==========
    /// Start of a new stream.
    StreamStart {
        /// Unique stream identifier.
        stream_id: String,
    },

    /// Defines the timeline for following packets.
    Segment(Segment),

    /// Format of following packets.
    Caps(Caps),

    /// No more data will follow on this pad.
    Eos,

    // ========== Upstream Events ==========
    /// Request an encoder upstream to produce a key unit.
    ForceKeyUnit(ForceKeyUnit),

    // ========== Bidirectional Events ==========
    /// Discard queued data immediately.
    FlushStart,

    /// Resume after a flush.
    FlushStop {
        /// Whether running time restarts at zero.
        reset_time: bool,
    },

    /// Application-defined event.
    Custom {
        /// Event name.
        name: String,
        /// Travel direction.
        upstream: bool,
    },
}

/// Discriminant of [`PadEvent`], for counting and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadEventKind {
    /// [`PadEvent::StreamStart`]
    StreamStart,
    /// [`PadEvent::Segment`]
    Segment,
    /// [`PadEvent::Caps`]
    Caps,
    /// [`PadEvent::Eos`]
    Eos,
    /// [`PadEvent::ForceKeyUnit`]
    ForceKeyUnit,
    /// [`PadEvent::FlushStart`]
    FlushStart,
    /// [`PadEvent::FlushStop`]
    FlushStop,
    /// [`PadEvent::Custom`]
    Custom,
}

impl PadEvent {
    /// Event kind without payload.
    pub fn kind(&self) -> PadEventKind {
        match self {
            PadEvent::StreamStart { .. } => PadEventKind::StreamStart,
            PadEvent::Segment(_) => PadEventKind::Segment,
            PadEvent::Caps(_) => PadEventKind::Caps,
            PadEvent::Eos => PadEventKind::Eos,
            PadEvent::ForceKeyUnit(_) => PadEventKind::ForceKeyUnit,
            PadEvent::FlushStart => PadEventKind::FlushStart,
            PadEvent::FlushStop { .. } => PadEventKind::FlushStop,
            PadEvent::Custom { .. } => PadEventKind::Custom,
        }
    }

    /// Check if this event flows downstream (with data).
    pub fn is_downstream(&self) -> bool {
        match self {
            PadEvent::ForceKeyUnit(fku) => !fku.upstream,
            PadEvent::Custom { upstream, .. } => !upstream,
            _ => true,
        }
    }

    /// Check if this event flows upstream (against data).
    pub fn is_upstream(&self) -> bool {
        match self {
            PadEvent::ForceKeyUnit(fku) => fku.upstream,
            PadEvent::Custom { upstream, .. } => *upstream,
            PadEvent::FlushStart | PadEvent::FlushStop { .. } => true,
            _ => false,
        }
    }

    /// Check if this event must reach the other side of every pad.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            PadEvent::Eos | PadEvent::FlushStart | PadEvent::FlushStop { .. }
        )
    }

    /// Get a human-readable name for this event type.
    pub fn name(&self) -> &str {
        match self {
            PadEvent::StreamStart { .. } => "stream-start",
            PadEvent::Segment(_) => "segment",
            PadEvent::Caps(_) => "caps",
            PadEvent::Eos => "eos",
            PadEvent::ForceKeyUnit(_) => "force-key-unit",
            PadEvent::FlushStart => "flush-start",
            PadEvent::FlushStop { .. } => "flush-stop",
            PadEvent::Custom { name, .. } => name,
        }
    }

    /// Check the event payload for consistency.
    ///
    /// Caps are validated structurally by construction; segments and
    /// stream ids are checked here.
    pub fn validate(&self) -> Result<()> {
        match self {
            PadEvent::StreamStart { stream_id } if stream_id.is_empty() => {
                Err(Error::Protocol("stream-start with empty stream id".into()))
            }
            PadEvent::Segment(segment) => segment.validate(),
            PadEvent::Caps(caps) if caps.media_type().is_empty() => {
                Err(Error::Protocol("caps event without media type".into()))
            }
            PadEvent::Custom { name, .. } if name.is_empty() => {
                Err(Error::Protocol("custom event without a name".into()))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for PadEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PadEvent::StreamStart { stream_id } => write!(f, "stream-start({stream_id})"),
            PadEvent::Segment(s) => write!(f, "segment({}..{}, rate {})", s.start, s.stop, s.rate),
            PadEvent::Caps(caps) => write!(f, "caps({caps})"),
            PadEvent::FlushStop { reset_time } => write!(f, "flush-stop(reset={reset_time})"),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Time segment: the range and rate of following packets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// Segment start.
    pub start: ClockTime,
    /// Segment stop, `NONE` for open-ended.
    pub stop: ClockTime,
    /// Playback rate (1.0 = normal speed). Never zero.
    pub rate: f64,
    /// Running-time offset.
    pub base: ClockTime,
}

impl Segment {
    /// Open-ended segment starting at `start`.
    pub fn new(start: ClockTime) -> Self {
        Self {
            start,
            stop: ClockTime::NONE,
            rate: 1.0,
            base: ClockTime::ZERO,
        }
    }

    /// Set the stop position.
    pub fn with_stop(mut self, stop: ClockTime) -> Self {
        self.stop = stop;
        self
    }

    /// Set the playback rate.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Check rate and bounds.
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0.0 || !self.rate.is_finite() {
            return Err(Error::Protocol(format!("segment rate {} is invalid", self.rate)));
        }
        if self.start.is_none() {
            return Err(Error::Protocol("segment without start".into()));
        }
        if self.stop.is_some() && self.stop < self.start {
            return Err(Error::Protocol(format!(
                "segment stop {} before start {}",
                self.stop, self.start
            )));
        }
        Ok(())
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new(ClockTime::ZERO)
    }
}

// ============================================================================
// Force key unit
// ============================================================================

/// Key-unit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceKeyUnit {
    /// Travels upstream toward the encoder when set.
    pub upstream: bool,
    /// Whether every following stream should also start with a key unit.
    pub all_headers: bool,
    /// Request sequence number.
    pub count: u32,
}

impl ForceKeyUnit {
    /// Upstream request, the form a receiver sends when it needs a keyframe.
    pub fn upstream() -> Self {
        Self {
            upstream: true,
            all_headers: true,
            count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_direction() {
        assert!(PadEvent::Eos.is_downstream());
        assert!(!PadEvent::Eos.is_upstream());
        assert!(PadEvent::ForceKeyUnit(ForceKeyUnit::upstream()).is_upstream());
        assert!(PadEvent::FlushStart.is_upstream() && PadEvent::FlushStart.is_downstream());
    }

    #[test]
    fn test_mandatory_events() {
        assert!(PadEvent::Eos.is_mandatory());
        assert!(PadEvent::FlushStart.is_mandatory());
        assert!(PadEvent::FlushStop { reset_time: true }.is_mandatory());
        assert!(!PadEvent::Segment(Segment::default()).is_mandatory());
        assert!(!PadEvent::Caps(Caps::new("application/x-rtp")).is_mandatory());
    }

    #[test]
    fn test_segment_validation() {
        assert!(Segment::default().validate().is_ok());
        assert!(Segment::default().with_rate(0.0).validate().is_err());
        assert!(Segment::default().with_rate(f64::NAN).validate().is_err());
        let backwards = Segment::new(ClockTime::from_secs(10)).with_stop(ClockTime::from_secs(5));
        assert!(PadEvent::Segment(backwards).validate().is_err());
    }

    #[test]
    fn test_names_and_display() {
        assert_eq!(PadEvent::FlushStart.name(), "flush-start");
        assert_eq!(PadEvent::Eos.kind(), PadEventKind::Eos);
        let custom = PadEvent::Custom {
            name: "marker".into(),
            upstream: false,
        };
        assert_eq!(custom.name(), "marker");
        assert_eq!(
            PadEvent::StreamStart {
                stream_id: "s0".into()
            }
            .to_string(),
            "stream-start(s0)"
        );
        assert!(
            PadEvent::StreamStart {
                stream_id: String::new()
            }
            .validate()
            .is_err()
        );
    }
}
