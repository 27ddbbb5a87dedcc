//! Feedback sink adapter: graph to transport.
//!
//! [`FeedbackSink`] is installed as the push callback of a `feedbacksink`
//! element. The engine calls it with each feedback packet (typically an RTCP
//! receiver report) and it forwards the bytes to the host's
//! [`PacketWriter`]. Partial writes are legal; the engine's
//! [`RetryOutlet`] redelivers the unaccepted tail.

use crate::engine::{PushHandler, PushResult};
use crate::liveness::Liveness;
use crate::observability::SessionMetrics;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Host transport
// ============================================================================

/// Outbound half of the host's packet transport.
pub trait PacketWriter: Send + Sync {
    /// Send up to `data.len()` bytes, returning how many were taken.
    ///
    /// `WouldBlock` counts as zero bytes taken.
    fn write_packet(&self, data: &[u8]) -> io::Result<usize>;
}

/// [`PacketWriter`] over a kanal channel. A full channel takes zero bytes.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: kanal::Sender<Bytes>,
}

impl ChannelWriter {
    /// Create a writer and the receiver the host drains.
    pub fn bounded(capacity: usize) -> (Self, kanal::Receiver<Bytes>) {
        let (tx, rx) = kanal::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Create a writer that never fills.
    pub fn unbounded() -> (Self, kanal::Receiver<Bytes>) {
        let (tx, rx) = kanal::unbounded();
        (Self { tx }, rx)
    }
}

impl PacketWriter for ChannelWriter {
    fn write_packet(&self, data: &[u8]) -> io::Result<usize> {
        match self.tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(true) => Ok(data.len()),
            Ok(false) => Ok(0),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "feedback channel closed",
            )),
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Feedback sink counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Push calls that reached the transport.
    pub packets: u64,
    /// Bytes the transport accepted.
    pub bytes_accepted: u64,
    /// Pushes where fewer bytes were accepted than offered.
    pub partial_writes: u64,
    /// Pushes that failed outright.
    pub errors: u64,
    /// Pushes turned away because teardown had begun.
    pub rejected: u64,
}

#[derive(Default)]
struct SinkCounters {
    packets: AtomicU64,
    bytes_accepted: AtomicU64,
    partial_writes: AtomicU64,
    errors: AtomicU64,
    rejected: AtomicU64,
}

/// Push callback forwarding feedback packets to a [`PacketWriter`].
///
/// Shares nothing mutable with the packet source: its own writer, its own
/// counters, and a read-only view of the session liveness flag.
pub struct FeedbackSink<W: PacketWriter> {
    writer: W,
    liveness: Liveness,
    metrics: SessionMetrics,
    counters: SinkCounters,
}

impl<W: PacketWriter> FeedbackSink<W> {
    /// Create an adapter for `writer`.
    pub fn new(writer: W, liveness: Liveness, metrics: SessionMetrics) -> Self {
        Self {
            writer,
            liveness,
            metrics,
            counters: SinkCounters::default(),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            bytes_accepted: self.counters.bytes_accepted.load(Ordering::Relaxed),
            partial_writes: self.counters.partial_writes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<W: PacketWriter> PushHandler for FeedbackSink<W> {
    fn push(&self, from: &[u8]) -> PushResult {
        let Some(_guard) = self.liveness.enter() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_rejected();
            return PushResult::Error;
        };

        let accepted = match self.writer.write_packet(from) {
            Ok(n) => n.min(from.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %self.metrics.session(),
                    error = %e,
                    len = from.len(),
                    "feedback write failed"
                );
                return PushResult::Error;
            }
        };

        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_accepted
            .fetch_add(accepted as u64, Ordering::Relaxed);
        if accepted < from.len() {
            self.counters.partial_writes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                session = %self.metrics.session(),
                offered = from.len(),
                accepted,
                "partial feedback write"
            );
        }
        self.metrics.record_push(from.len(), accepted);
        PushResult::Accepted(accepted)
    }
}

// ============================================================================
// Engine-side retry
// ============================================================================

/// Outcome of one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutletReport {
    /// Bytes the push callback accepted.
    pub accepted: usize,
    /// Bytes abandoned after the retry budget ran out.
    pub dropped: usize,
}

/// Wraps a push callback for the engine and redelivers partial writes.
///
/// The unaccepted tail of a packet is kept and offered again before any
/// newer packet. A packet whose delivery failed more than `max_retries`
/// times is dropped and reported in [`OutletReport::dropped`]; the engine
/// turns that into a degraded warning on the bus.
pub struct RetryOutlet {
    element: String,
    handler: Arc<dyn PushHandler>,
    max_retries: u32,
    backlog: VecDeque<Bytes>,
    failures: u32,
}

impl RetryOutlet {
    /// Wrap `handler` for the element named `element`.
    pub fn new(
        element: impl Into<String>,
        handler: Arc<dyn PushHandler>,
        max_retries: u32,
    ) -> Self {
        Self {
            element: element.into(),
            handler,
            max_retries,
            backlog: VecDeque::new(),
            failures: 0,
        }
    }

    /// Name of the element this outlet serves.
    pub fn element(&self) -> &str {
        &self.element
    }

    /// Bytes waiting for delivery.
    pub fn pending_bytes(&self) -> usize {
        self.backlog.iter().map(Bytes::len).sum()
    }

    /// Queue a packet behind any pending tail and deliver what can be delivered.
    pub fn offer(&mut self, data: Bytes) -> OutletReport {
        if !data.is_empty() {
            self.backlog.push_back(data);
        }
        self.flush()
    }

    /// Retry pending data. Stops at the first packet the callback does not
    /// take completely.
    pub fn flush(&mut self) -> OutletReport {
        let mut report = OutletReport::default();

        while let Some(front) = self.backlog.front_mut() {
            let offered = front.len();
            match self.handler.push(front) {
                PushResult::Accepted(n) if n >= offered => {
                    report.accepted += offered;
                    self.backlog.pop_front();
                    self.failures = 0;
                }
                result => {
                    if let PushResult::Accepted(n) = result {
                        report.accepted += n;
                        let _ = front.split_to(n);
                    }
                    self.failures += 1;
                    if self.failures <= self.max_retries {
                        break;
                    }
                    let lost = self.backlog.pop_front().map_or(0, |b| b.len());
                    report.dropped += lost;
                    self.failures = 0;
                    tracing::warn!(
                        element = %self.element,
                        dropped = lost,
                        "feedback retries exhausted"
                    );
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for RetryOutlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOutlet")
            .field("element", &self.element)
            .field("max_retries", &self.max_retries)
            .field("pending_bytes", &self.pending_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Accepts the sizes in `script` in order, then everything.
    struct ScriptedWriter {
        script: Mutex<VecDeque<io::Result<usize>>>,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedWriter {
        fn new(script: Vec<io::Result<usize>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    impl PacketWriter for ScriptedWriter {
        fn write_packet(&self, data: &[u8]) -> io::Result<usize> {
            let n = match self.script.lock().unwrap().pop_front() {
                Some(Ok(n)) => n.min(data.len()),
                Some(Err(e)) => return Err(e),
                None => data.len(),
            };
            self.written.lock().unwrap().push(data[..n].to_vec());
            Ok(n)
        }
    }

    fn sink(script: Vec<io::Result<usize>>) -> Arc<FeedbackSink<ScriptedWriter>> {
        Arc::new(FeedbackSink::new(
            ScriptedWriter::new(script),
            Liveness::new(),
            SessionMetrics::new("test"),
        ))
    }

    #[test]
    fn test_push_forwards_and_counts() {
        let sink = sink(vec![Ok(120)]);
        assert_eq!(sink.push(&[0u8; 200]), PushResult::Accepted(120));
        assert_eq!(sink.push(&[0u8; 50]), PushResult::Accepted(50));
        let stats = sink.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes_accepted, 170);
        assert_eq!(stats.partial_writes, 1);
    }

    #[test]
    fn test_push_after_teardown_is_rejected() {
        let liveness = Liveness::new();
        let writer = ScriptedWriter::new(vec![]);
        let sink = FeedbackSink::new(writer, liveness.clone(), SessionMetrics::new("test"));
        liveness.begin_teardown();
        assert_eq!(sink.push(&[1, 2, 3]), PushResult::Error);
        assert_eq!(sink.stats().rejected, 1);
        assert!(sink.writer.written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_error_is_reported() {
        let sink = sink(vec![Err(io::Error::other("down"))]);
        assert_eq!(sink.push(&[1]), PushResult::Error);
        assert_eq!(sink.stats().errors, 1);
    }

    #[test]
    fn test_outlet_redelivers_tail() {
        let sink = sink(vec![Ok(120)]);
        let mut outlet = RetryOutlet::new("fb", sink.clone(), 3);

        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let report = outlet.offer(Bytes::from(data.clone()));
        assert_eq!(report, OutletReport { accepted: 120, dropped: 0 });
        assert_eq!(outlet.pending_bytes(), 80);

        let report = outlet.flush();
        assert_eq!(report, OutletReport { accepted: 80, dropped: 0 });
        assert_eq!(outlet.pending_bytes(), 0);

        let written = sink.writer.written.lock().unwrap();
        assert_eq!(written[1], data[120..].to_vec());
    }

    #[test]
    fn test_outlet_tail_goes_before_newer_packets() {
        let sink = sink(vec![Ok(2)]);
        let mut outlet = RetryOutlet::new("fb", sink.clone(), 3);
        outlet.offer(Bytes::from_static(b"abcd"));
        outlet.offer(Bytes::from_static(b"ef"));

        let written = sink.writer.written.lock().unwrap();
        assert_eq!(written.as_slice(), [b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()]);
    }

    #[test]
    fn test_outlet_drops_after_retries() {
        let sink = sink(vec![Ok(0), Ok(0), Ok(0)]);
        let mut outlet = RetryOutlet::new("fb", sink.clone(), 2);
        assert_eq!(outlet.offer(Bytes::from_static(b"xyz")).dropped, 0);
        assert_eq!(outlet.flush().dropped, 0);
        let report = outlet.flush();
        assert_eq!(report.dropped, 3);
        assert_eq!(outlet.pending_bytes(), 0);
    }

    #[test]
    fn test_channel_writer() {
        let (writer, rx) = ChannelWriter::bounded(1);
        assert_eq!(writer.write_packet(b"rr").unwrap(), 2);
        assert_eq!(writer.write_packet(b"rr").unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"rr"));
        drop(rx);
        assert!(writer.write_packet(b"rr").is_err());
    }
}
