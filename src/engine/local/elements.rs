//! Built-in elements of the local engine.
//!
//! | Factory | Role | Purpose |
//! |---------|------|---------|
//! | `packetsrc` | source | Fed by a pull callback; stamps RTP packets with a PTS |
//! | `identity`, `queue` | transform | Pass-through with a packet counter |
//! | `capsfilter` | transform | Fixes or refines the caps flowing downstream |
//! | `rtcpreporter` | transform | Builds receiver reports for a `feedbacksink` |
//! | `feedbacksink` | sink | Hands packets to a push callback |
//! | `appsink` | sink | Exposes processed packets to the host |

use super::element::{Element, ElementRole, ProcessContext, PropertyTable};
use crate::caps::Caps;
use crate::engine::{BusMessage, GraphState, PropertyValue};
use crate::error::{Error, Result};
use crate::event::PadEvent;
use crate::packet::{Packet, PacketKind, RtpTimestampUnwrapper};
use crate::rtcp::{Feedback, RtcpReporter, parse_feedback};
use std::time::Duration;

fn parse_caps_property(props: &PropertyTable) -> Result<Option<Caps>> {
    match props.string("caps") {
        Some(text) if !text.trim().is_empty() => Caps::parse(text).map(Some),
        _ => Ok(None),
    }
}

// ============================================================================
// packetsrc
// ============================================================================

/// Source element fed by a pull callback.
pub struct PacketSrc {
    props: PropertyTable,
    caps: Option<Caps>,
    unwrapper: Option<RtpTimestampUnwrapper>,
}

impl PacketSrc {
    /// Create with default properties.
    pub fn new() -> Self {
        Self {
            props: PropertyTable::new()
                .with("caps", PropertyValue::String(String::new()))
                .with("format", PropertyValue::String("bytes".into()))
                .with("is-live", PropertyValue::Bool(true))
                .with("user-data", PropertyValue::Opaque(None))
                .with_read_only("packets", PropertyValue::Int64(0)),
            caps: None,
            unwrapper: None,
        }
    }
}

impl Default for PacketSrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for PacketSrc {
    fn factory(&self) -> &'static str {
        "packetsrc"
    }

    fn role(&self) -> ElementRole {
        ElementRole::Source
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn change_state(&mut self, from: GraphState, to: GraphState) -> Result<()> {
        match (from, to) {
            (GraphState::Null, GraphState::Ready) => {
                self.caps = parse_caps_property(&self.props)?;
                self.unwrapper = self
                    .caps
                    .as_ref()
                    .and_then(Caps::clock_rate)
                    .map(RtpTimestampUnwrapper::new);
            }
            (GraphState::Paused, GraphState::Ready) => {
                if let Some(unwrapper) = &mut self.unwrapper {
                    unwrapper.reset();
                }
            }
            (GraphState::Ready, GraphState::Null) => {
                self.caps = None;
                self.unwrapper = None;
            }
            _ => {}
        }
        Ok(())
    }

    fn caps(&self) -> Option<Caps> {
        self.caps.clone()
    }

    fn process(&mut self, mut packet: Packet, _ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        self.props.increment("packets", 1);
        if let (Some(unwrapper), Some(rtp)) = (&mut self.unwrapper, packet.rtp()) {
            let pts = unwrapper.pts(rtp.timestamp);
            packet.set_pts(pts);
        }
        Ok(Some(packet))
    }
}

// ============================================================================
// identity / queue
// ============================================================================

/// Pass-through element.
///
/// `error-after` makes the element fail once that many packets went by,
/// which posts a fatal error on the bus.
pub struct Identity {
    factory: &'static str,
    props: PropertyTable,
}

impl Identity {
    /// Create an `identity` element.
    pub fn new() -> Self {
        Self::with_factory("identity")
    }

    /// Create under another factory name (`queue`).
    pub fn with_factory(factory: &'static str) -> Self {
        Self {
            factory,
            props: PropertyTable::new()
                .with("error-after", PropertyValue::Int64(-1))
                .with_read_only("processed", PropertyValue::Int64(0)),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for Identity {
    fn factory(&self) -> &'static str {
        self.factory
    }

    fn role(&self) -> ElementRole {
        ElementRole::Transform
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn process(&mut self, packet: Packet, _ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        let processed = self.props.int64("processed").unwrap_or(0);
        let limit = self.props.int64("error-after").unwrap_or(-1);
        if limit >= 0 && processed >= limit {
            return Err(Error::Element(format!(
                "{} failed after {processed} packets",
                self.factory
            )));
        }
        self.props.increment("processed", 1);
        Ok(Some(packet))
    }
}

// ============================================================================
// capsfilter
// ============================================================================

/// Refines caps events with fixed fields.
///
/// Fields set on the filter override upstream values; upstream fields the
/// filter does not mention pass through.
pub struct CapsFilter {
    props: PropertyTable,
}

impl CapsFilter {
    /// Create with empty caps (pass everything).
    pub fn new() -> Self {
        Self {
            props: PropertyTable::new().with("caps", PropertyValue::String(String::new())),
        }
    }

    fn refine(filter: &Caps, upstream: &Caps) -> Caps {
        let mut out = filter.clone();
        for (key, value) in upstream.fields() {
            if filter.get(key).is_none() {
                out.set(key, value.clone());
            }
        }
        out
    }
}

impl Default for CapsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for CapsFilter {
    fn factory(&self) -> &'static str {
        "capsfilter"
    }

    fn role(&self) -> ElementRole {
        ElementRole::Transform
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn change_state(&mut self, from: GraphState, to: GraphState) -> Result<()> {
        if from == GraphState::Null && to == GraphState::Ready {
            parse_caps_property(&self.props)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: PadEvent, ctx: &mut ProcessContext) -> Option<PadEvent> {
        let PadEvent::Caps(upstream) = event else {
            return Some(event);
        };
        match parse_caps_property(&self.props) {
            Ok(Some(filter)) => Some(PadEvent::Caps(Self::refine(&filter, &upstream))),
            Ok(None) => Some(PadEvent::Caps(upstream)),
            Err(e) => {
                ctx.post(BusMessage::Warning {
                    source: ctx.element().to_string(),
                    message: format!("ignoring filter caps: {e}"),
                    degraded: false,
                });
                Some(PadEvent::Caps(upstream))
            }
        }
    }
}

// ============================================================================
// rtcpreporter
// ============================================================================

/// Observes RTP flowing through and sends receiver reports to the
/// `feedbacksink` named by its `feedback` property.
///
/// RTCP arriving on the same chain is consumed: sender reports feed the
/// round-trip fields of later receiver reports.
pub struct RtcpReporterElement {
    props: PropertyTable,
    reporter: Option<RtcpReporter>,
}

impl RtcpReporterElement {
    /// Create with default properties.
    pub fn new() -> Self {
        Self {
            props: PropertyTable::new()
                .with("ssrc", PropertyValue::Int64(1))
                .with("interval-ms", PropertyValue::Int64(5000))
                .with("clock-rate", PropertyValue::Int64(90_000))
                .with("feedback", PropertyValue::String(String::new()))
                .with_read_only("reports", PropertyValue::Int64(0)),
            reporter: None,
        }
    }

    fn build_reporter(&self, clock_rate: u32) -> RtcpReporter {
        let ssrc = self.props.int64("ssrc").unwrap_or(1) as u32;
        let interval_ms = self.props.int64("interval-ms").unwrap_or(5000).max(0) as u64;
        RtcpReporter::new(ssrc)
            .with_clock_rate(clock_rate)
            .with_interval(Duration::from_millis(interval_ms))
    }
}

impl Default for RtcpReporterElement {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for RtcpReporterElement {
    fn factory(&self) -> &'static str {
        "rtcpreporter"
    }

    fn role(&self) -> ElementRole {
        ElementRole::Transform
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn change_state(&mut self, from: GraphState, to: GraphState) -> Result<()> {
        match (from, to) {
            (GraphState::Null, GraphState::Ready) => {
                let rate = self.props.int64("clock-rate").unwrap_or(90_000);
                if rate <= 0 || rate > u32::MAX as i64 {
                    return Err(Error::Element(format!("invalid clock-rate {rate}")));
                }
                self.reporter = Some(self.build_reporter(rate as u32));
            }
            (GraphState::Ready, GraphState::Null) => self.reporter = None,
            _ => {}
        }
        Ok(())
    }

    fn process(&mut self, packet: Packet, ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        let Some(reporter) = &mut self.reporter else {
            return Ok(Some(packet));
        };
        let now = ctx.now();

        if packet.kind() == PacketKind::Rtcp {
            match parse_feedback(packet.data()) {
                Ok(parts) => {
                    for part in parts {
                        if let Feedback::SenderReport { ssrc, ntp_time, .. } = part {
                            reporter.on_sender_report(ssrc, ntp_time, now);
                        }
                    }
                }
                Err(e) => tracing::debug!(element = %ctx.element(), error = %e, "bad RTCP"),
            }
            return Ok(None);
        }

        if let Some(rtp) = packet.rtp() {
            reporter.on_rtp(rtp, now);
        }

        let target = self.props.string("feedback").unwrap_or_default();
        if !target.is_empty() && reporter.report_due(now) {
            let report = reporter.build_report(now)?;
            ctx.push_to(target, report);
            self.props.increment("reports", 1);
        }
        Ok(Some(packet))
    }

    fn handle_event(&mut self, event: PadEvent, _ctx: &mut ProcessContext) -> Option<PadEvent> {
        if let PadEvent::Caps(caps) = &event {
            let unused = self
                .reporter
                .as_ref()
                .is_some_and(|r| r.stats().rtp_observed == 0);
            if let (true, Some(rate)) = (unused, caps.clock_rate()) {
                self.reporter = Some(self.build_reporter(rate));
            }
        }
        Some(event)
    }
}

// ============================================================================
// feedbacksink
// ============================================================================

/// Sink whose packets leave the graph through a push callback.
pub struct FeedbackSinkElement {
    props: PropertyTable,
}

impl FeedbackSinkElement {
    /// Create with default properties.
    pub fn new() -> Self {
        Self {
            props: PropertyTable::new()
                .with("user-data", PropertyValue::Opaque(None))
                .with("max-retries", PropertyValue::Int64(3))
                .with_read_only("packets", PropertyValue::Int64(0)),
        }
    }
}

impl Default for FeedbackSinkElement {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for FeedbackSinkElement {
    fn factory(&self) -> &'static str {
        "feedbacksink"
    }

    fn role(&self) -> ElementRole {
        ElementRole::Sink
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn has_push_slot(&self) -> bool {
        true
    }

    fn process(&mut self, packet: Packet, ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        self.props.increment("packets", 1);
        ctx.push(packet.into_data());
        Ok(None)
    }
}

// ============================================================================
// appsink
// ============================================================================

/// Terminal sink exposing processed packets through a channel.
///
/// When `max-buffers` packets are waiting, new ones are dropped and counted
/// in `dropped`.
pub struct AppSink {
    props: PropertyTable,
    tx: kanal::Sender<Packet>,
    rx: kanal::Receiver<Packet>,
}

impl AppSink {
    /// Create with default properties.
    pub fn new() -> Self {
        let (tx, rx) = kanal::unbounded();
        Self {
            props: PropertyTable::new()
                .with("max-buffers", PropertyValue::Int64(1024))
                .with_read_only("caps", PropertyValue::String(String::new()))
                .with_read_only("packets", PropertyValue::Int64(0))
                .with_read_only("dropped", PropertyValue::Int64(0)),
            tx,
            rx,
        }
    }
}

impl Default for AppSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for AppSink {
    fn factory(&self) -> &'static str {
        "appsink"
    }

    fn role(&self) -> ElementRole {
        ElementRole::Sink
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }

    fn properties_mut(&mut self) -> &mut PropertyTable {
        &mut self.props
    }

    fn process(&mut self, packet: Packet, _ctx: &mut ProcessContext) -> Result<Option<Packet>> {
        let limit = self.props.int64("max-buffers").unwrap_or(0);
        if limit > 0 && self.tx.len() >= limit as usize {
            self.props.increment("dropped", 1);
            return Ok(None);
        }
        self.props.increment("packets", 1);
        let _ = self.tx.try_send(packet);
        Ok(None)
    }

    fn handle_event(&mut self, event: PadEvent, _ctx: &mut ProcessContext) -> Option<PadEvent> {
        if let PadEvent::Caps(caps) = &event {
            self.props
                .update("caps", PropertyValue::String(caps.to_string()));
        }
        Some(event)
    }

    fn output(&self) -> Option<kanal::Receiver<Packet>> {
        Some(self.rx.clone())
    }
}
