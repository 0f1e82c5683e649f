// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-packet stream analysis: codec identification, frame typing, and
//! timestamp-deviation tracking.

use crate::codec::{self, h264, h265, FrameKind, NalKind};
use crate::rtp::RtpPacket;
use crate::WallTime;

/// One analysis record per received packet, in arrival order.
#[derive(Clone, Debug)]
pub struct PacketAnalysis {
    /// 1-based arrival index within the session.
    pub packet_number: u64,
    pub received_wall: WallTime,
    pub payload_type: u8,
    pub frame_kind: FrameKind,
    /// Computed size: header + CSRCs + extension + payload.
    pub wire_size: usize,
    pub rtp_timestamp: u32,
    /// `rtp_timestamp` scaled to microseconds by the payload type's clock
    /// rate, truncating.
    pub rtp_timestamp_us: u64,
    pub sequence_number: u16,
    pub mark: bool,
    pub ssrc: u32,
    /// Inter-frame timing jitter in RTP clock ticks; see
    /// [`Classifier::analyze`] for the exact law.
    pub timestamp_deviation: i64,
}

/// Aggregate jitter statistics over the deviations actually recorded:
/// interior fragments (deviation trivially zero) and the very first
/// packet are excluded.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviationStats {
    count: u64,
    sum: i64,
    min: Option<i64>,
    max: Option<i64>,
}

impl DeviationStats {
    fn record(&mut self, deviation: i64) {
        self.count += 1;
        self.sum += deviation;
        self.min = Some(self.min.map_or(deviation, |m| m.min(deviation)));
        self.max = Some(self.max.map_or(deviation, |m| m.max(deviation)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    pub fn min(&self) -> i64 {
        self.min.unwrap_or(0)
    }

    pub fn max(&self) -> i64 {
        self.max.unwrap_or(0)
    }
}

/// Session-scoped packet classifier.
///
/// All state is owned here; two sessions never share counters. Feed every
/// packet of the session through [`Classifier::analyze`] in arrival
/// order.
#[derive(Default)]
pub struct Classifier {
    packet_count: u64,

    // Deviation tracking.
    last_timestamp: Option<u32>,
    last_unique_timestamp: Option<u32>,
    expected_increment: Option<i64>,
    stats: DeviationStats,

    // Fragment annotation.
    current_frame_timestamp: Option<u32>,
    fragment_counter: u32,
    frame_start_packet_number: u64,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn deviation_stats(&self) -> &DeviationStats {
        &self.stats
    }

    /// Analyzes the next packet of the session.
    ///
    /// The timestamp-deviation law: the first packet's deviation is 0.
    /// The first packet with a *new* timestamp fixes the expected
    /// per-frame increment and also reports 0. Every later frame boundary
    /// reports `(t_k - t_{k-1}) - expected`. Packets repeating the
    /// current frame's timestamp report 0 and leave all state untouched.
    pub fn analyze(&mut self, pkt: &RtpPacket) -> PacketAnalysis {
        self.packet_count += 1;

        let rtp_timestamp = pkt.timestamp();
        let payload_type = pkt.payload_type();

        // Fragment bookkeeping runs for every packet so that interior
        // fragments can name their parent packet and 1-based index.
        if self.current_frame_timestamp != Some(rtp_timestamp) {
            self.current_frame_timestamp = Some(rtp_timestamp);
            self.fragment_counter = 1;
            self.frame_start_packet_number = self.packet_count;
        } else {
            self.fragment_counter += 1;
        }

        let frame_kind = self.classify_payload(payload_type, pkt.payload());

        let clock_rate = codec::clock_rate(payload_type);
        let rtp_timestamp_us = u64::from(rtp_timestamp) * 1_000_000 / u64::from(clock_rate);

        PacketAnalysis {
            packet_number: self.packet_count,
            received_wall: pkt.received_wall(),
            payload_type,
            frame_kind,
            wire_size: pkt.wire_size(),
            rtp_timestamp,
            rtp_timestamp_us,
            sequence_number: pkt.sequence_number(),
            mark: pkt.mark(),
            ssrc: pkt.ssrc(),
            timestamp_deviation: self.timestamp_deviation(rtp_timestamp),
        }
    }

    fn classify_payload(&self, payload_type: u8, payload: &[u8]) -> FrameKind {
        if payload.is_empty() {
            return FrameKind::Unknown;
        }
        match payload_type {
            96 | 189 => match h264::classify(payload) {
                h264::Classified::Single(k) => FrameKind::Single(NalKind::H264(k)),
                h264::Classified::FragmentStart(k) => FrameKind::FragmentStart(NalKind::H264(k)),
                h264::Classified::FragmentInterior => FrameKind::FragmentContinue {
                    parent: self.frame_start_packet_number,
                    index: self.fragment_counter,
                },
                h264::Classified::FragmentEnd(k) => FrameKind::FragmentEnd(NalKind::H264(k)),
                h264::Classified::Aggregate(a) => FrameKind::Aggregate(a),
                h264::Classified::Unknown => FrameKind::Unknown,
            },
            97 => match h265::classify(payload) {
                Some(k) => FrameKind::Single(NalKind::H265(k)),
                None => FrameKind::Unknown,
            },
            26 => FrameKind::Jpeg,
            pt if codec::is_audio(pt) => FrameKind::Audio,
            _ => FrameKind::Unknown,
        }
    }

    fn timestamp_deviation(&mut self, timestamp: u32) -> i64 {
        if self.last_timestamp == Some(timestamp) {
            return 0;
        }
        let last_unique = match self.last_unique_timestamp {
            None => {
                self.last_unique_timestamp = Some(timestamp);
                self.last_timestamp = Some(timestamp);
                return 0;
            }
            Some(t) => t,
        };
        // Wrapping subtraction keeps the law correct across the 32-bit
        // timestamp wraparound.
        let diff = i64::from(timestamp.wrapping_sub(last_unique) as i32);
        let deviation = match self.expected_increment {
            None => {
                self.expected_increment = Some(diff);
                0
            }
            Some(expected) => diff - expected,
        };
        self.last_unique_timestamp = Some(timestamp);
        self.last_timestamp = Some(timestamp);
        self.stats.record(deviation);
        deviation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;
    use crate::PacketContext;

    fn packet(seq: u16, timestamp: u32, pt: u8, payload: &[u8]) -> RtpPacket {
        RtpPacketBuilder {
            sequence_number: seq,
            timestamp,
            payload_type: pt,
            ssrc: 0x1234,
            mark: false,
            ctx: PacketContext::dummy(),
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[test]
    fn deviation_law() {
        let mut c = Classifier::new();
        let d: Vec<i64> = [1000u32, 1090, 2270]
            .iter()
            .map(|&ts| c.analyze(&packet(0, ts, 96, b"\x65\x00")).timestamp_deviation)
            .collect();
        assert_eq!(d, vec![0, 0, 1090]);
        // The first packet is excluded from the statistics.
        assert_eq!(c.deviation_stats().count(), 2);
        assert_eq!(c.deviation_stats().min(), 0);
        assert_eq!(c.deviation_stats().max(), 1090);
        assert_eq!(c.deviation_stats().average(), 545.0);
    }

    #[test]
    fn repeated_timestamp_is_zero_deviation() {
        let mut c = Classifier::new();
        c.analyze(&packet(1, 1000, 96, b"\x65\x00"));
        c.analyze(&packet(2, 2000, 96, b"\x65\x00"));
        let a = c.analyze(&packet(3, 2000, 96, b"\x65\x00"));
        assert_eq!(a.timestamp_deviation, 0);
        // Nothing recorded for the repeat.
        assert_eq!(c.deviation_stats().count(), 1);
        // The next boundary still measures from 2000.
        let a = c.analyze(&packet(4, 3100, 96, b"\x65\x00"));
        assert_eq!(a.timestamp_deviation, 100);
    }

    #[test]
    fn fragment_annotation() {
        let mut c = Classifier::new();
        let a = c.analyze(&packet(1, 5000, 96, b"\x7c\x85\x01"));
        assert_eq!(a.frame_kind.to_string(), "I-frame");
        let a = c.analyze(&packet(2, 5000, 96, b"\x7c\x05\x01"));
        assert_eq!(
            a.frame_kind,
            FrameKind::FragmentContinue {
                parent: 1,
                index: 2
            }
        );
        let a = c.analyze(&packet(3, 5000, 96, b"\x7c\x05\x01"));
        assert_eq!(a.frame_kind.to_string(), "Fragment(1,3)");
        let a = c.analyze(&packet(4, 5000, 96, b"\x7c\x45\x01"));
        assert_eq!(a.frame_kind.to_string(), "I-frame-End");
        // New timestamp resets the counters.
        let a = c.analyze(&packet(5, 8600, 96, b"\x7c\x05\x01"));
        assert_eq!(
            a.frame_kind,
            FrameKind::FragmentContinue {
                parent: 5,
                index: 1
            }
        );
    }

    #[test]
    fn payload_type_dispatch() {
        let mut c = Classifier::new();
        assert_eq!(
            c.analyze(&packet(1, 0, 26, b"\xff\xd8")).frame_kind,
            FrameKind::Jpeg
        );
        assert_eq!(
            c.analyze(&packet(2, 0, 0, b"\x01\x02")).frame_kind,
            FrameKind::Audio
        );
        assert_eq!(
            c.analyze(&packet(3, 0, 97, b"\x42\x01\x01"))
                .frame_kind
                .to_string(),
            "SPS"
        );
        assert_eq!(
            c.analyze(&packet(4, 0, 50, b"\x01\x02")).frame_kind,
            FrameKind::Unknown
        );
        // Empty payloads are unclassifiable regardless of type.
        assert_eq!(
            c.analyze(&packet(5, 0, 0, b"")).frame_kind,
            FrameKind::Unknown
        );
    }

    #[test]
    fn microsecond_timestamp_uses_clock_rate() {
        let mut c = Classifier::new();
        let a = c.analyze(&packet(1, 8_000, 0, b"\x01\x02"));
        assert_eq!(a.rtp_timestamp_us, 1_000_000);
        let a = c.analyze(&packet(2, 90_000, 96, b"\x65\x00"));
        assert_eq!(a.rtp_timestamp_us, 1_000_000);
    }

    #[test]
    fn analysis_carries_packet_fields() {
        let mut c = Classifier::new();
        let a = c.analyze(&packet(42, 1000, 96, b"\x65\x00"));
        assert_eq!(a.packet_number, 1);
        assert_eq!(a.sequence_number, 42);
        assert_eq!(a.ssrc, 0x1234);
        assert_eq!(a.wire_size, 14);
        assert!(!a.mark);
    }
}
