//! Packets crossing the transport boundary.
//!
//! A [`Packet`] wraps an immutable [`Bytes`] buffer. The pull and push
//! callbacks never hand a `Packet` across the boundary directly: the engine
//! lends a `&mut [u8]` for the duration of a pull and a `&[u8]` for the
//! duration of a push, so neither side can keep an alias after the call.

use crate::clock::ClockTime;
use crate::error::{Error, Result};

use bytes::Bytes;
use rtp::header::Header;
use webrtc_util::marshal::Unmarshal;

/// Fixed RTP header length (no CSRCs, no extension).
pub const RTP_HEADER_LEN: usize = 12;

/// Minimum RTCP packet length (common header plus SSRC).
pub const RTCP_MIN_LEN: usize = 8;

// ============================================================================
// Classification
// ============================================================================

/// What a datagram on a multiplexed RTP/RTCP transport carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// RTP media packet.
    Rtp,
    /// RTCP control packet.
    Rtcp,
    /// Anything else (wrong version, too short).
    Unknown,
}

/// Classify a datagram following the RFC 5761 demultiplexing rule.
///
/// Both protocols carry version 2 in the top bits of the first byte. RTCP
/// packet types 192..=223 collide with RTP marker+payload type values that
/// RTP is not allowed to use, so the second byte decides.
pub fn classify(data: &[u8]) -> PacketKind {
    if data.len() < RTCP_MIN_LEN || data[0] >> 6 != 2 {
        return PacketKind::Unknown;
    }
    match data[1] {
        192..=223 => PacketKind::Rtcp,
        _ if data.len() >= RTP_HEADER_LEN => PacketKind::Rtp,
        _ => PacketKind::Unknown,
    }
}

// ============================================================================
// RTP header info
// ============================================================================

/// Header fields of an RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpInfo {
    /// Sequence number.
    pub seq: u16,
    /// Media timestamp in clock-rate ticks.
    pub timestamp: u32,
    /// Synchronization source.
    pub ssrc: u32,
    /// Payload type.
    pub payload_type: u8,
    /// Marker bit.
    pub marker: bool,
}

impl RtpInfo {
    /// Parse the RTP header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let header = Header::unmarshal(&mut buf)
            .map_err(|e| Error::Protocol(format!("RTP header: {e}")))?;
        Ok(Self {
            seq: header.sequence_number,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
            payload_type: header.payload_type,
            marker: header.marker,
        })
    }
}

// ============================================================================
// Packet
// ============================================================================

/// An encoded packet plus the metadata the graph attaches to it.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    kind: PacketKind,
    rtp: Option<RtpInfo>,
    pts: ClockTime,
}

impl Packet {
    /// Wrap raw bytes, classifying and parsing the RTP header if present.
    pub fn new(data: Bytes) -> Self {
        let kind = classify(&data);
        let rtp = match kind {
            PacketKind::Rtp => RtpInfo::parse(&data).ok(),
            _ => None,
        };
        Self {
            data,
            kind,
            rtp,
            pts: ClockTime::NONE,
        }
    }

    /// Copy a borrowed slice into a new packet.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    /// Packet bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the packet, returning its bytes.
    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// RTP, RTCP, or unknown.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Parsed RTP header, if this is an RTP packet.
    pub fn rtp(&self) -> Option<&RtpInfo> {
        self.rtp.as_ref()
    }

    /// Presentation time, `NONE` until assigned.
    pub fn pts(&self) -> ClockTime {
        self.pts
    }

    /// Set the presentation time.
    pub fn set_pts(&mut self, pts: ClockTime) {
        self.pts = pts;
    }

    /// Builder form of [`set_pts`](Self::set_pts).
    pub fn with_pts(mut self, pts: ClockTime) -> Self {
        self.pts = pts;
        self
    }
}

// ============================================================================
// Timestamp unwrapping
// ============================================================================

/// Extends 32-bit RTP timestamps into a monotonic timeline.
///
/// Forward jumps under 2^31 ticks count as progress, larger ones as a
/// backwards step across the wrap. The first timestamp seen becomes time
/// zero.
#[derive(Debug, Clone)]
pub struct RtpTimestampUnwrapper {
    clock_rate: u32,
    state: Option<UnwrapState>,
}

#[derive(Debug, Clone, Copy)]
struct UnwrapState {
    base: i64,
    extended: i64,
    previous: u32,
}

impl RtpTimestampUnwrapper {
    /// Create an unwrapper for a stream with the given clock rate.
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            state: None,
        }
    }

    /// Clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Feed a timestamp, returning the extended tick count.
    pub fn extend(&mut self, timestamp: u32) -> i64 {
        match &mut self.state {
            None => {
                let extended = timestamp as i64;
                self.state = Some(UnwrapState {
                    base: extended,
                    extended,
                    previous: timestamp,
                });
                extended
            }
            Some(state) => {
                let delta = timestamp.wrapping_sub(state.previous) as i32;
                state.extended += delta as i64;
                state.previous = timestamp;
                state.extended
            }
        }
    }

    /// Feed a timestamp, returning its presentation time.
    ///
    /// Timestamps before the first one clamp to zero.
    pub fn pts(&mut self, timestamp: u32) -> ClockTime {
        let extended = self.extend(timestamp);
        let base = self.state.map(|s| s.base).unwrap_or(extended);
        let ticks = (extended - base).max(0) as u64;
        ClockTime::from_rtp_ticks(ticks, self.clock_rate)
    }

    /// Forget the timeline; the next timestamp becomes time zero.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(seq: u16, ts: u32, pt: u8) -> Vec<u8> {
        let mut buf = vec![0x80, pt, 0, 0, 0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78, 0xAA];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[4..8].copy_from_slice(&ts.to_be_bytes());
        buf
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&rtp_packet(1, 0, 96)), PacketKind::Rtp);
        // Receiver report header: V=2, PT=201, length=1
        let rr = [0x80, 201, 0, 1, 0, 0, 0, 1];
        assert_eq!(classify(&rr), PacketKind::Rtcp);
        assert_eq!(classify(&[0x00; 12]), PacketKind::Unknown);
        assert_eq!(classify(&[0x80, 96]), PacketKind::Unknown);
    }

    #[test]
    fn test_packet_parses_rtp_header() {
        let packet = Packet::copy_from_slice(&rtp_packet(513, 90_000, 0x80 | 100));
        let rtp = packet.rtp().unwrap();
        assert_eq!(rtp.seq, 513);
        assert_eq!(rtp.timestamp, 90_000);
        assert_eq!(rtp.ssrc, 0x1234_5678);
        assert_eq!(rtp.payload_type, 100);
        assert!(rtp.marker);
        assert!(packet.pts().is_none());
    }

    #[test]
    fn test_extend_forward() {
        let mut unwrapper = RtpTimestampUnwrapper::new(90_000);
        assert_eq!(unwrapper.pts(1_000), ClockTime::ZERO);
        assert_eq!(unwrapper.pts(1_000 + 3_000), ClockTime::from_nanos(33_333_333));
        assert_eq!(unwrapper.pts(1_000 + 90_000), ClockTime::from_secs(1));
    }

    #[test]
    fn test_extend_across_wrap() {
        let mut unwrapper = RtpTimestampUnwrapper::new(90_000);
        unwrapper.pts(u32::MAX - 44_999);
        assert_eq!(unwrapper.pts(45_000), ClockTime::from_secs(1));
    }

    #[test]
    fn test_extend_reordered() {
        let mut unwrapper = RtpTimestampUnwrapper::new(48_000);
        unwrapper.pts(10_000);
        assert_eq!(unwrapper.pts(10_960), ClockTime::from_millis(20));
        // late packet steps backwards, earlier than the first one clamps to zero
        assert_eq!(unwrapper.extend(10_000), 10_000);
        assert_eq!(unwrapper.pts(9_040), ClockTime::ZERO);
        // zero is a legal first timestamp
        let mut unwrapper = RtpTimestampUnwrapper::new(48_000);
        assert_eq!(unwrapper.pts(0), ClockTime::ZERO);
        assert_eq!(unwrapper.pts(48_000), ClockTime::from_secs(1));
    }
}
