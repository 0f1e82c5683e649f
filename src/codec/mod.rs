// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Payload-type tables, frame classification variants, and grouping of
//! packets into access units by RTP timestamp.

use std::fmt::Display;

use bytes::Bytes;

pub mod h264;
pub mod h265;

/// Codec name for a payload type, per the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1)
/// plus the dynamic assignments (72, 96, 97, 189) seen on the cameras
/// this tool targets.
pub fn payload_type_name(pt: u8) -> Option<&'static str> {
    Some(match pt {
        0 => "PCMU",
        1 | 2 | 19 => "Reserved",
        3 => "GSM",
        4 => "G723",
        5 | 6 | 16 | 17 => "DVI4",
        7 => "LPC",
        8 => "PCMA",
        9 => "G722",
        10 | 11 => "L16",
        12 => "QCELP",
        13 => "CN",
        14 => "MPA",
        15 => "G728",
        18 => "G729",
        20 => "Unassigned",
        26 => "JPEG",
        28 => "nv",
        31 => "H261",
        32 => "MPV",
        33 => "MP2T",
        34 => "H263",
        72 => "PCM-Mu-Law",
        96 => "H264",
        97 => "H265",
        189 => "H264-Dynamic",
        _ => return None,
    })
}

/// Renders a payload type code as its codec name, or `Unknown(<code>)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PayloadTypeName(pub u8);

impl Display for PayloadTypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match payload_type_name(self.0) {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown({})", self.0),
        }
    }
}

/// RTP clock rate in Hz for a payload type. Unregistered codes get the
/// video rate, which is what dynamic camera assignments use in practice.
pub fn clock_rate(pt: u8) -> u32 {
    match pt {
        0 | 3 | 4 | 5 | 7 | 8 | 9 | 12 | 15 | 72 => 8_000,
        6 => 16_000,
        10 | 11 => 44_100,
        14 | 26 | 28 | 31 | 32 | 33 | 34 | 96 | 97 | 189 => 90_000,
        _ => 90_000,
    }
}

/// Payload types classified as audio for the video-only capture policy.
pub fn is_audio(pt: u8) -> bool {
    matches!(pt, 0 | 3 | 4 | 8 | 9 | 12 | 14 | 15 | 18 | 72)
}

/// A NAL unit kind from either supported video codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalKind {
    H264(h264::NalKind),
    H265(h265::NalKind),
}

impl Display for NalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalKind::H264(k) => k.fmt(f),
            NalKind::H265(k) => k.fmt(f),
        }
    }
}

/// An RFC 6184 aggregation packet format. Reported by name, not expanded
/// into its constituent NAL units.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    StapA,
    StapB,
    Mtap16,
    Mtap24,
}

impl Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AggregateKind::StapA => "STAP-A",
            AggregateKind::StapB => "STAP-B",
            AggregateKind::Mtap16 => "MTAP16",
            AggregateKind::Mtap24 => "MTAP24",
        })
    }
}

/// Semantic classification of one RTP packet's payload.
///
/// A closed variant set; the legacy string forms (`"Fragment(12,3)"`,
/// `"I-frame-End"`) exist only in the `Display` impl, for sinks that
/// serialize analysis records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// An unfragmented NAL unit.
    Single(NalKind),

    /// First fragment of a fragmentation unit; carries the original NAL's
    /// kind from the FU header.
    FragmentStart(NalKind),

    /// Interior fragment. `parent` is the packet number of the first
    /// packet in the access unit; `index` is this packet's 1-based
    /// position within it.
    FragmentContinue { parent: u64, index: u32 },

    /// Final fragment of a fragmentation unit.
    FragmentEnd(NalKind),

    Aggregate(AggregateKind),
    Jpeg,
    Audio,
    Unknown,
}

impl Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Single(k) | FrameKind::FragmentStart(k) => k.fmt(f),
            FrameKind::FragmentContinue { parent, index } => {
                write!(f, "Fragment({},{})", parent, index)
            }
            FrameKind::FragmentEnd(k) => write!(f, "{}-End", k),
            FrameKind::Aggregate(k) => k.fmt(f),
            FrameKind::Jpeg => f.write_str("JPEG"),
            FrameKind::Audio => f.write_str("Audio"),
            FrameKind::Unknown => f.write_str("Unknown"),
        }
    }
}

/// One packet's contribution to an access unit.
#[derive(Clone, Debug)]
pub struct GroupedPacket {
    pub packet_number: u64,
    pub payload: Bytes,
}

/// The packets sharing one RTP timestamp, in arrival order: one access
/// unit. Lives only long enough to be defragmented and handed to sinks.
#[derive(Clone, Debug)]
pub struct FrameGroup {
    pub rtp_timestamp: u32,
    pub packets: Vec<GroupedPacket>,
}

impl FrameGroup {
    pub fn first_packet_number(&self) -> u64 {
        self.packets.first().map(|p| p.packet_number).unwrap_or(0)
    }

    pub fn last_packet_number(&self) -> u64 {
        self.packets.last().map(|p| p.packet_number).unwrap_or(0)
    }

    pub fn payload_len(&self) -> usize {
        self.packets.iter().map(|p| p.payload.len()).sum()
    }
}

/// Accumulates packets into [`FrameGroup`]s by RTP timestamp.
///
/// Grouping relies entirely on arrival order: a group is finalized the
/// instant a packet with a *different* timestamp appears, and timestamps
/// are never reordered. Out-of-order network delivery is not corrected.
#[derive(Default)]
pub struct FrameGrouper {
    current: Option<FrameGroup>,
}

impl FrameGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a packet. Returns the previous group iff this packet's
    /// timestamp finalized it.
    pub fn push(
        &mut self,
        packet_number: u64,
        rtp_timestamp: u32,
        payload: Bytes,
    ) -> Option<FrameGroup> {
        if let Some(g) = self.current.as_mut() {
            if g.rtp_timestamp == rtp_timestamp {
                g.packets.push(GroupedPacket {
                    packet_number,
                    payload,
                });
                return None;
            }
        }
        let finished = self.current.take();
        self.current = Some(FrameGroup {
            rtp_timestamp,
            packets: vec![GroupedPacket {
                packet_number,
                payload,
            }],
        });
        finished
    }

    /// Flushes the in-progress group at end of stream.
    pub fn finish(&mut self) -> Option<FrameGroup> {
        self.current.take()
    }
}
