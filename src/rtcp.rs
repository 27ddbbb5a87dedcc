//! RTCP reception statistics and feedback packets.
//!
//! [`RtcpReporter`] watches RTP packets on their way into the graph and
//! periodically produces a Receiver Report. It does not own a socket: the
//! marshalled report is handed to the graph's feedback sink, which pushes
//! it to the host transport.
//!
//! [`parse_feedback`] splits a compound RTCP packet into the pieces a host
//! typically acts on (sender/receiver reports, picture loss).

use crate::error::{Error, Result};
use crate::packet::RtpInfo;

use bytes::Bytes;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use webrtc_util::marshal::{Marshal, Unmarshal};

/// Default RTCP report interval (5 seconds per RFC 3550).
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum RTCP report interval.
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_millis(100);

const PT_SENDER_REPORT: u8 = 200;
const PT_RECEIVER_REPORT: u8 = 201;
const PT_PAYLOAD_FEEDBACK: u8 = 206;
const FMT_PLI: u8 = 1;

// ============================================================================
// Reception Statistics
// ============================================================================

/// Statistics for a single RTP source being received.
#[derive(Debug, Clone, Default)]
pub struct ReceptionStats {
    /// SSRC of the source being tracked.
    pub ssrc: u32,
    /// Total packets received from this source.
    pub packets_received: u64,
    /// First sequence number seen.
    pub base_seq: Option<u16>,
    /// Highest extended sequence number (cycles << 16 | seq).
    pub highest_seq: u32,
    /// Sequence number wraparounds.
    pub seq_cycles: u16,
    /// Interarrival jitter estimate in timestamp units.
    pub jitter: f64,
    /// Middle 32 bits of the last Sender Report NTP time.
    pub last_sr_ntp: u32,
    /// When the last Sender Report arrived.
    pub last_sr_time: Option<Instant>,
    last_seq: u16,
    prev_transit: Option<i64>,
    clock_rate: u32,
}

impl ReceptionStats {
    /// Create new reception stats for a source.
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate,
            ..Default::default()
        }
    }

    /// Update statistics with a received packet.
    pub fn update(&mut self, rtp: &RtpInfo, arrival: Instant, epoch: Instant) {
        self.packets_received += 1;

        if self.base_seq.is_none() {
            self.base_seq = Some(rtp.seq);
            self.last_seq = rtp.seq;
            self.highest_seq = rtp.seq as u32;
        } else {
            if rtp.seq < self.last_seq && self.last_seq > 0xF000 && rtp.seq < 0x1000 {
                self.seq_cycles = self.seq_cycles.wrapping_add(1);
            }
            let extended = (self.seq_cycles as u32) << 16 | rtp.seq as u32;
            if extended > self.highest_seq {
                self.highest_seq = extended;
            }
            self.last_seq = rtp.seq;
        }

        // RFC 3550 A.8: J += (|D| - J) / 16, D the change in relative transit time.
        let arrival_ticks =
            (arrival.duration_since(epoch).as_nanos() * self.clock_rate as u128 / 1_000_000_000)
                as i64;
        let transit = arrival_ticks - rtp.timestamp as i64;
        if let Some(prev) = self.prev_transit {
            let d = (transit - prev).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.prev_transit = Some(transit);
    }

    /// Packets expected according to the sequence number range.
    pub fn expected(&self) -> u32 {
        let base = self.base_seq.unwrap_or(0) as u32;
        self.highest_seq.wrapping_sub(base).wrapping_add(1)
    }

    /// Cumulative packets lost.
    pub fn lost(&self) -> u32 {
        self.expected().saturating_sub(self.packets_received as u32)
    }

    /// Fraction lost since the previous report, in 1/256 units.
    pub fn fraction_lost(&self, prev_expected: u32, prev_received: u64) -> u8 {
        let expected_interval = self.expected().saturating_sub(prev_expected);
        let received_interval = self.packets_received.saturating_sub(prev_received) as u32;
        if expected_interval == 0 {
            return 0;
        }
        let lost_interval = expected_interval.saturating_sub(received_interval);
        ((lost_interval as u64 * 256) / expected_interval as u64).min(255) as u8
    }

    /// Record receipt of a Sender Report.
    pub fn record_sr(&mut self, ntp_time: u64, now: Instant) {
        self.last_sr_ntp = ((ntp_time >> 16) & 0xFFFF_FFFF) as u32;
        self.last_sr_time = Some(now);
    }

    fn to_reception_report(&self, fraction_lost: u8, now: Instant) -> ReceptionReport {
        // Delay since last SR in 1/65536 seconds.
        let delay = self
            .last_sr_time
            .map(|t| (now.duration_since(t).as_secs_f64() * 65536.0).min(u32::MAX as f64) as u32)
            .unwrap_or(0);

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost: self.lost(),
            last_sequence_number: self.highest_seq,
            jitter: self.jitter as u32,
            last_sender_report: self.last_sr_ntp,
            delay,
        }
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Reporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpStats {
    /// RTP packets observed.
    pub rtp_observed: u64,
    /// Receiver reports produced.
    pub rr_sent: u64,
    /// Bytes of reports produced.
    pub bytes_sent: u64,
}

/// Builds Receiver Reports from observed RTP traffic.
#[derive(Debug)]
pub struct RtcpReporter {
    ssrc: u32,
    clock_rate: u32,
    interval: Duration,
    epoch: Instant,
    last_report: Option<Instant>,
    sources: HashMap<u32, ReceptionStats>,
    prev: HashMap<u32, (u32, u64)>,
    stats: RtcpStats,
}

impl RtcpReporter {
    /// Create a reporter sending as `ssrc`.
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            clock_rate: 90_000,
            interval: DEFAULT_REPORT_INTERVAL,
            epoch: Instant::now(),
            last_report: None,
            sources: HashMap::new(),
            prev: HashMap::new(),
            stats: RtcpStats::default(),
        }
    }

    /// Set the clock rate of observed streams.
    pub fn with_clock_rate(mut self, rate: u32) -> Self {
        self.clock_rate = rate;
        self
    }

    /// Set the report interval (clamped to [`MIN_REPORT_INTERVAL`]).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_REPORT_INTERVAL);
        self
    }

    /// Our SSRC.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Report interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Counters.
    pub fn stats(&self) -> RtcpStats {
        self.stats
    }

    /// Reception stats for a source.
    pub fn source(&self, ssrc: u32) -> Option<&ReceptionStats> {
        self.sources.get(&ssrc)
    }

    /// Observe an RTP packet.
    pub fn on_rtp(&mut self, rtp: &RtpInfo, arrival: Instant) {
        let clock_rate = self.clock_rate;
        self.sources
            .entry(rtp.ssrc)
            .or_insert_with(|| ReceptionStats::new(rtp.ssrc, clock_rate))
            .update(rtp, arrival, self.epoch);
        self.stats.rtp_observed += 1;
    }

    /// Observe a Sender Report from a remote source.
    pub fn on_sender_report(&mut self, ssrc: u32, ntp_time: u64, now: Instant) {
        if let Some(source) = self.sources.get_mut(&ssrc) {
            source.record_sr(ntp_time, now);
        }
    }

    /// Whether a report is due. The first report waits one interval.
    pub fn report_due(&mut self, now: Instant) -> bool {
        let last = *self.last_report.get_or_insert(now);
        !self.sources.is_empty() && now.duration_since(last) >= self.interval
    }

    /// Build and marshal a Receiver Report covering every observed source.
    pub fn build_report(&mut self, now: Instant) -> Result<Bytes> {
        let mut ssrcs: Vec<u32> = self.sources.keys().copied().collect();
        ssrcs.sort_unstable();

        let mut reports = Vec::with_capacity(ssrcs.len());
        for ssrc in ssrcs {
            let Some(source) = self.sources.get(&ssrc) else {
                continue;
            };
            let (prev_expected, prev_received) = self.prev.get(&ssrc).copied().unwrap_or((0, 0));
            let fraction = source.fraction_lost(prev_expected, prev_received);
            reports.push(source.to_reception_report(fraction, now));
            self.prev
                .insert(ssrc, (source.expected(), source.packets_received));
        }

        let rr = ReceiverReport {
            ssrc: self.ssrc,
            reports,
            profile_extensions: Bytes::new(),
        };
        let bytes = rr
            .marshal()
            .map_err(|e| Error::Element(format!("RTCP marshal error: {e}")))?;

        self.last_report = Some(now);
        self.stats.rr_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(bytes)
    }
}

// ============================================================================
// Feedback parsing
// ============================================================================

/// A reception report block, as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportBlock {
    /// SSRC being reported on.
    pub ssrc: u32,
    /// Fraction lost in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost.
    pub total_lost: u32,
    /// Highest extended sequence number.
    pub highest_seq: u32,
    /// Interarrival jitter.
    pub jitter: u32,
}

/// One packet of a compound RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Sender Report.
    SenderReport {
        /// Sender SSRC.
        ssrc: u32,
        /// NTP timestamp.
        ntp_time: u64,
        /// Matching RTP timestamp.
        rtp_time: u32,
        /// Packets sent.
        packet_count: u32,
    },
    /// Receiver Report.
    ReceiverReport {
        /// Reporter SSRC.
        ssrc: u32,
        /// Report blocks.
        reports: Vec<ReportBlock>,
    },
    /// Picture Loss Indication: the receiver needs a key unit.
    PictureLoss {
        /// Requesting SSRC.
        sender_ssrc: u32,
        /// Media source that should send a key unit.
        media_ssrc: u32,
    },
    /// Any other packet type.
    Other {
        /// RTCP packet type.
        packet_type: u8,
    },
}

/// Split a compound RTCP packet and decode the parts hosts act on.
pub fn parse_feedback(data: &[u8]) -> Result<Vec<Feedback>> {
    let mut out = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::Protocol("truncated RTCP header".into()));
        }
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if len > rest.len() {
            return Err(Error::Protocol(format!(
                "RTCP length {len} exceeds remaining {}",
                rest.len()
            )));
        }
        let (packet, tail) = rest.split_at(len);
        out.push(decode_one(packet)?);
        rest = tail;
    }

    Ok(out)
}

fn decode_one(packet: &[u8]) -> Result<Feedback> {
    let packet_type = packet[1];
    let fmt = packet[0] & 0x1F;
    let mut buf = packet;

    let feedback = match packet_type {
        PT_SENDER_REPORT => {
            let sr = SenderReport::unmarshal(&mut buf)
                .map_err(|e| Error::Protocol(format!("RTCP SR parse error: {e}")))?;
            Feedback::SenderReport {
                ssrc: sr.ssrc,
                ntp_time: sr.ntp_time,
                rtp_time: sr.rtp_time,
                packet_count: sr.packet_count,
            }
        }
        PT_RECEIVER_REPORT => {
            let rr = ReceiverReport::unmarshal(&mut buf)
                .map_err(|e| Error::Protocol(format!("RTCP RR parse error: {e}")))?;
            Feedback::ReceiverReport {
                ssrc: rr.ssrc,
                reports: rr
                    .reports
                    .into_iter()
                    .map(|r| ReportBlock {
                        ssrc: r.ssrc,
                        fraction_lost: r.fraction_lost,
                        total_lost: r.total_lost,
                        highest_seq: r.last_sequence_number,
                        jitter: r.jitter,
                    })
                    .collect(),
            }
        }
        PT_PAYLOAD_FEEDBACK if fmt == FMT_PLI => {
            let pli = PictureLossIndication::unmarshal(&mut buf)
                .map_err(|e| Error::Protocol(format!("RTCP PLI parse error: {e}")))?;
            Feedback::PictureLoss {
                sender_ssrc: pli.sender_ssrc,
                media_ssrc: pli.media_ssrc,
            }
        }
        other => Feedback::Other { packet_type: other },
    };

    Ok(feedback)
}

/// Build a Picture Loss Indication asking `media_ssrc` for a key unit.
pub fn picture_loss_indication(sender_ssrc: u32, media_ssrc: u32) -> Result<Bytes> {
    PictureLossIndication {
        sender_ssrc,
        media_ssrc,
    }
    .marshal()
    .map_err(|e| Error::Element(format!("RTCP marshal error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(seq: u16, timestamp: u32) -> RtpInfo {
        RtpInfo {
            seq,
            timestamp,
            ssrc: 0x1234_5678,
            payload_type: 96,
            marker: false,
        }
    }

    #[test]
    fn test_reception_stats_sequence_wrap() {
        let mut stats = ReceptionStats::new(0x1234_5678, 90_000);
        let epoch = Instant::now();
        for (i, seq) in [65534u16, 65535, 0, 1].into_iter().enumerate() {
            stats.update(&rtp(seq, i as u32 * 3000), epoch, epoch);
        }
        assert_eq!(stats.seq_cycles, 1);
        assert_eq!(stats.highest_seq, (1 << 16) | 1);
        assert_eq!(stats.expected(), 4);
        assert_eq!(stats.lost(), 0);
    }

    #[test]
    fn test_loss_accounting() {
        let mut stats = ReceptionStats::new(1, 90_000);
        let epoch = Instant::now();
        for seq in [100u16, 101, 104, 105] {
            stats.update(&rtp(seq, 0), epoch, epoch);
        }
        assert_eq!(stats.expected(), 6);
        assert_eq!(stats.lost(), 2);
        // 2 of 6 lost -> 85/256
        assert_eq!(stats.fraction_lost(0, 0), 85);
        assert_eq!(stats.fraction_lost(6, 4), 0);
    }

    #[test]
    fn test_report_roundtrips_through_parser() {
        let now = Instant::now();
        let mut reporter = RtcpReporter::new(0xCAFE).with_interval(Duration::from_millis(100));
        assert!(!reporter.report_due(now));
        reporter.on_rtp(&rtp(10, 0), now);
        reporter.on_rtp(&rtp(12, 3000), now);
        assert!(reporter.report_due(now + Duration::from_millis(150)));

        let bytes = reporter.build_report(now).unwrap();
        assert_eq!(bytes.len(), 8 + 24);
        assert_eq!(reporter.stats().rr_sent, 1);

        let parsed = parse_feedback(&bytes).unwrap();
        match &parsed[0] {
            Feedback::ReceiverReport { ssrc, reports } => {
                assert_eq!(*ssrc, 0xCAFE);
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].ssrc, 0x1234_5678);
                assert_eq!(reports[0].total_lost, 1);
                assert_eq!(reports[0].highest_seq, 12);
            }
            other => panic!("unexpected feedback {other:?}"),
        }
    }

    #[test]
    fn test_compound_with_pli() {
        let mut reporter = RtcpReporter::new(7);
        reporter.on_rtp(&rtp(1, 0), Instant::now());
        let mut compound = reporter.build_report(Instant::now()).unwrap().to_vec();
        compound.extend_from_slice(&picture_loss_indication(7, 0x1234_5678).unwrap());

        let parsed = parse_feedback(&compound).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed[1],
            Feedback::PictureLoss {
                sender_ssrc: 7,
                media_ssrc: 0x1234_5678
            }
        );
    }

    #[test]
    fn test_truncated_feedback() {
        assert!(parse_feedback(&[0x80, 201]).is_err());
        assert!(parse_feedback(&[0x80, 201, 0, 9, 0, 0, 0, 1]).is_err());
        assert!(parse_feedback(&[]).unwrap().is_empty());
    }
}
