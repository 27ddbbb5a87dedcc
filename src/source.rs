//! Packet source adapter: transport to graph.
//!
//! [`PacketSource`] is installed as the pull callback of a `packetsrc`
//! element. Each pull waits at most [`SourceConfig::pull_timeout`] for one
//! packet from the host's [`PacketReader`] and copies it into the buffer
//! the engine lends for the duration of the call.
//!
//! | Transport says | Pull returns |
//! |----------------|--------------|
//! | packet that fits | `Data(len)` |
//! | packet larger than the buffer | `Transient` (packet dropped and counted) |
//! | nothing within the timeout | `Data(0)` |
//! | closed, or [`PacketSource::end_stream`] was called | `EndOfStream`, forever after |
//! | anything, once teardown began | `EndOfStream` without touching the transport |

use crate::config::SourceConfig;
use crate::engine::{PullHandler, PullResult};
use crate::liveness::Liveness;
use crate::observability::SessionMetrics;
use crate::packet::{PacketKind, classify};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Host transport
// ============================================================================

/// Result of one bounded read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One whole packet.
    Packet(Bytes),
    /// Nothing arrived in time.
    Timeout,
    /// The transport is closed; nothing more will arrive.
    Closed,
}

/// Inbound half of the host's packet transport.
pub trait PacketReader: Send + Sync {
    /// Wait at most `timeout` for the next packet.
    fn read_packet(&self, timeout: Duration) -> ReadOutcome;

    /// Stop delivering packets. Later reads return [`ReadOutcome::Closed`].
    fn close(&self) {}
}

/// [`PacketReader`] over a kanal channel.
pub struct ChannelTransport {
    rx: kanal::Receiver<Bytes>,
}

impl ChannelTransport {
    /// Create a transport and the sender the host feeds packets into.
    pub fn new() -> (Self, kanal::Sender<Bytes>) {
        let (tx, rx) = kanal::unbounded();
        (Self { rx }, tx)
    }

    /// Create a transport with a bounded queue.
    pub fn bounded(capacity: usize) -> (Self, kanal::Sender<Bytes>) {
        let (tx, rx) = kanal::bounded(capacity);
        (Self { rx }, tx)
    }
}

impl PacketReader for ChannelTransport {
    fn read_packet(&self, timeout: Duration) -> ReadOutcome {
        if timeout.is_zero() {
            return match self.rx.try_recv() {
                Ok(Some(packet)) => ReadOutcome::Packet(packet),
                Ok(None) => ReadOutcome::Timeout,
                Err(_) => ReadOutcome::Closed,
            };
        }
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => ReadOutcome::Packet(packet),
            Err(kanal::ReceiveErrorTimeout::Timeout) => ReadOutcome::Timeout,
            Err(_) => ReadOutcome::Closed,
        }
    }

    fn close(&self) {
        let _ = self.rx.close();
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Packet source counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Packets handed to the graph.
    pub packets: u64,
    /// Bytes handed to the graph.
    pub bytes: u64,
    /// Pulls that found nothing within the timeout.
    pub timeouts: u64,
    /// Packets dropped because they did not fit the engine's buffer.
    pub oversized: u64,
    /// RTCP packets diverted to the tap.
    pub rtcp_diverted: u64,
    /// RTCP packets dropped because the tap was full.
    pub rtcp_dropped: u64,
    /// Pulls turned away because teardown had begun.
    pub rejected: u64,
}

#[derive(Default)]
struct SourceCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    timeouts: AtomicU64,
    oversized: AtomicU64,
    rtcp_diverted: AtomicU64,
    rtcp_dropped: AtomicU64,
    rejected: AtomicU64,
}

/// Pull callback reading packets from a [`PacketReader`].
pub struct PacketSource<R: PacketReader> {
    reader: R,
    config: SourceConfig,
    liveness: Liveness,
    metrics: SessionMetrics,
    ended: AtomicBool,
    tap: Option<(kanal::Sender<Bytes>, kanal::Receiver<Bytes>)>,
    counters: SourceCounters,
}

impl<R: PacketReader> PacketSource<R> {
    /// Create an adapter for `reader`.
    pub fn new(
        reader: R,
        config: SourceConfig,
        liveness: Liveness,
        metrics: SessionMetrics,
    ) -> Self {
        let tap = config
            .demux_rtcp
            .then(|| kanal::bounded(config.rtcp_tap_capacity));
        Self {
            reader,
            config,
            liveness,
            metrics,
            ended: AtomicBool::new(false),
            tap,
            counters: SourceCounters::default(),
        }
    }

    /// Receiver of RTCP packets diverted from the media transport.
    ///
    /// `None` unless [`SourceConfig::demux_rtcp`] is set. The tap holds at
    /// most [`SourceConfig::rtcp_tap_capacity`] packets; newer ones are
    /// dropped and counted while it is full.
    pub fn rtcp_tap(&self) -> Option<kanal::Receiver<Bytes>> {
        self.tap.as_ref().map(|(_, rx)| rx.clone())
    }

    /// Signal that no more packets will come. Every later pull returns
    /// `EndOfStream`.
    pub fn end_stream(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!(session = %self.metrics.session(), "end of stream requested");
        }
    }

    /// Whether the source reached end of stream.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Close the underlying transport.
    pub fn close_transport(&self) {
        self.reader.close();
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SourceStats {
        SourceStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            oversized: self.counters.oversized.load(Ordering::Relaxed),
            rtcp_diverted: self.counters.rtcp_diverted.load(Ordering::Relaxed),
            rtcp_dropped: self.counters.rtcp_dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn divert_rtcp(&self, packet: &Bytes) -> bool {
        let Some((tx, _)) = &self.tap else {
            return false;
        };
        if classify(packet) != PacketKind::Rtcp {
            return false;
        }
        match tx.try_send(packet.clone()) {
            Ok(true) => {
                self.counters.rtcp_diverted.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.rtcp_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(session = %self.metrics.session(), "RTCP tap full; dropping");
            }
        }
        true
    }
}

impl<R: PacketReader> PullHandler for PacketSource<R> {
    fn pull(&self, into: &mut [u8]) -> PullResult {
        let Some(_guard) = self.liveness.enter() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_rejected();
            return PullResult::EndOfStream;
        };
        if self.is_ended() {
            return PullResult::EndOfStream;
        }

        let packet = match self.reader.read_packet(self.config.pull_timeout) {
            ReadOutcome::Packet(packet) => packet,
            ReadOutcome::Timeout => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_pull_timeout();
                return PullResult::Data(0);
            }
            ReadOutcome::Closed => {
                self.ended.store(true, Ordering::SeqCst);
                tracing::debug!(session = %self.metrics.session(), "transport closed");
                return PullResult::EndOfStream;
            }
        };

        if packet.is_empty() || self.divert_rtcp(&packet) {
            return PullResult::Data(0);
        }

        if packet.len() > into.len() {
            self.counters.oversized.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_drop();
            tracing::warn!(
                session = %self.metrics.session(),
                len = packet.len(),
                capacity = into.len(),
                "dropping oversized packet"
            );
            return PullResult::Transient;
        }

        let len = packet.len();
        into[..len].copy_from_slice(&packet);
        self.counters.packets.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.metrics.record_pull(len);
        PullResult::Data(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(config: SourceConfig) -> (PacketSource<ChannelTransport>, kanal::Sender<Bytes>) {
        let (transport, tx) = ChannelTransport::new();
        let source = PacketSource::new(
            transport,
            config.with_pull_timeout(Duration::from_millis(5)),
            Liveness::new(),
            SessionMetrics::new("test"),
        );
        (source, tx)
    }

    #[test]
    fn test_pull_copies_packet() {
        let (source, tx) = source(SourceConfig::default());
        tx.send(Bytes::from_static(&[0x80, 96, 0, 1])).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::Data(4));
        assert_eq!(&buf[..4], &[0x80, 96, 0, 1]);
        assert_eq!(source.stats().packets, 1);
    }

    #[test]
    fn test_timeouts_are_not_eos() {
        let (source, _tx) = source(SourceConfig::default());
        let mut buf = [0u8; 16];
        for _ in 0..5 {
            assert_eq!(source.pull(&mut buf), PullResult::Data(0));
        }
        assert_eq!(source.stats().timeouts, 5);
        assert!(!source.is_ended());
    }

    #[test]
    fn test_oversized_packet_is_dropped() {
        let (source, tx) = source(SourceConfig::default());
        tx.send(Bytes::from(vec![0u8; 64])).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::Transient);
        assert_eq!(source.stats().oversized, 1);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_closed_transport_is_sticky_eos() {
        let (source, tx) = source(SourceConfig::default());
        drop(tx);
        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::EndOfStream);
        assert_eq!(source.pull(&mut buf), PullResult::EndOfStream);
        assert!(source.is_ended());
    }

    #[test]
    fn test_end_stream_before_close() {
        let (source, tx) = source(SourceConfig::default());
        tx.send(Bytes::from_static(b"late")).unwrap();
        source.end_stream();
        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::EndOfStream);
    }

    #[test]
    fn test_teardown_skips_transport() {
        let (transport, tx) = ChannelTransport::new();
        let liveness = Liveness::new();
        let source = PacketSource::new(
            transport,
            SourceConfig::default(),
            liveness.clone(),
            SessionMetrics::new("test"),
        );
        tx.send(Bytes::from_static(b"data")).unwrap();
        liveness.begin_teardown();

        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::EndOfStream);
        assert_eq!(source.stats().rejected, 1);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn test_rtcp_demux() {
        let (source, tx) = source(SourceConfig::default().with_rtcp_demux(true));
        let tap = source.rtcp_tap().unwrap();

        // Receiver report header: V=2, PT=201, length 1
        tx.send(Bytes::from_static(&[0x80, 201, 0, 1, 0, 0, 0, 1]))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(source.pull(&mut buf), PullResult::Data(0));
        assert_eq!(source.stats().rtcp_diverted, 1);
        assert_eq!(tap.try_recv().unwrap().unwrap().len(), 8);
    }

    #[test]
    fn test_full_rtcp_tap_drops_and_counts() {
        let config = SourceConfig::default()
            .with_rtcp_demux(true)
            .with_rtcp_tap_capacity(2);
        let (source, tx) = source(config);
        let tap = source.rtcp_tap().unwrap();

        let report = Bytes::from_static(&[0x80, 201, 0, 1, 0, 0, 0, 1]);
        let mut buf = [0u8; 16];
        for _ in 0..5 {
            tx.send(report.clone()).unwrap();
            assert_eq!(source.pull(&mut buf), PullResult::Data(0));
        }

        let stats = source.stats();
        assert_eq!(stats.rtcp_diverted, 2);
        assert_eq!(stats.rtcp_dropped, 3);
        assert_eq!(tap.len(), 2);
    }
}
