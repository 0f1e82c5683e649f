// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) payload
//! classification and reassembly per
//! [RFC 6184](https://tools.ietf.org/html/rfc6184).
//!
//! Reassembly produces Annex-B-style output: each NAL unit prefixed with
//! a `00 00 01` start code, FU-A fragments stitched back together under a
//! synthesized header. The contents of the NAL units are never inspected
//! beyond the header byte; this is deliberately a transport-layer tool.

use std::fmt::Display;

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};
use log::debug;

use super::{AggregateKind, FrameGroup};

/// Three-byte start code prepended to every emitted NAL unit.
const START_CODE: [u8; 3] = [0, 0, 1];

/// H.264 NAL unit kinds, with the forensic-report names used by the
/// analysis log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalKind {
    Unspecified,
    /// Coded slice of a non-IDR picture.
    NonIdrSlice,
    SlicePartitionA,
    SlicePartitionB,
    SlicePartitionC,
    /// Coded slice of an IDR picture.
    IdrSlice,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    Filler,
    SpsExt,
    PrefixNal,
    SubsetSps,
    AuxSlice,
    SliceExt,
    Other(u8),
}

impl NalKind {
    /// Maps a 5-bit NAL unit type to its kind.
    pub fn from_nal_type(nal_type: u8) -> Self {
        match nal_type {
            0 => NalKind::Unspecified,
            1 => NalKind::NonIdrSlice,
            2 => NalKind::SlicePartitionA,
            3 => NalKind::SlicePartitionB,
            4 => NalKind::SlicePartitionC,
            5 => NalKind::IdrSlice,
            6 => NalKind::Sei,
            7 => NalKind::Sps,
            8 => NalKind::Pps,
            9 => NalKind::AccessUnitDelimiter,
            10 => NalKind::EndOfSequence,
            11 => NalKind::EndOfStream,
            12 => NalKind::Filler,
            13 => NalKind::SpsExt,
            14 => NalKind::PrefixNal,
            15 => NalKind::SubsetSps,
            19 => NalKind::AuxSlice,
            20 => NalKind::SliceExt,
            n => NalKind::Other(n),
        }
    }
}

impl Display for NalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalKind::Unspecified => f.write_str("Unspecified"),
            NalKind::NonIdrSlice => f.write_str("P-frame"),
            NalKind::SlicePartitionA => f.write_str("Slice-PartA"),
            NalKind::SlicePartitionB => f.write_str("Slice-PartB"),
            NalKind::SlicePartitionC => f.write_str("Slice-PartC"),
            NalKind::IdrSlice => f.write_str("I-frame"),
            NalKind::Sei => f.write_str("SEI"),
            NalKind::Sps => f.write_str("SPS"),
            NalKind::Pps => f.write_str("PPS"),
            NalKind::AccessUnitDelimiter => f.write_str("AUD"),
            NalKind::EndOfSequence => f.write_str("End-Seq"),
            NalKind::EndOfStream => f.write_str("End-Stream"),
            NalKind::Filler => f.write_str("Filler"),
            NalKind::SpsExt => f.write_str("SPS-Ext"),
            NalKind::PrefixNal => f.write_str("Prefix-NAL"),
            NalKind::SubsetSps => f.write_str("Subset-SPS"),
            NalKind::AuxSlice => f.write_str("Aux-Slice"),
            NalKind::SliceExt => f.write_str("Slice-Ext"),
            NalKind::Other(n) => write!(f, "NAL-{}", n),
        }
    }
}

/// Per-packet classification, before the session-level fragment counters
/// turn `FragmentInterior` into `Fragment(<parent>,<index>)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Classified {
    Single(NalKind),
    FragmentStart(NalKind),
    FragmentInterior,
    FragmentEnd(NalKind),
    Aggregate(AggregateKind),
    Unknown,
}

/// Classifies one RTP payload per RFC 6184 section 5.2. Pure function of
/// the bytes; no session state involved.
pub(crate) fn classify(payload: &[u8]) -> Classified {
    if payload.len() < 2 {
        return Classified::Unknown;
    }
    match payload[0] & 0x1f {
        24 => Classified::Aggregate(AggregateKind::StapA),
        25 => Classified::Aggregate(AggregateKind::StapB),
        26 => Classified::Aggregate(AggregateKind::Mtap16),
        27 => Classified::Aggregate(AggregateKind::Mtap24),
        28 => classify_fu(payload, 2),
        29 => classify_fu(payload, 3),
        n => Classified::Single(NalKind::from_nal_type(n)),
    }
}

/// FU-A/FU-B. The second byte is the FU header: bit 7 start, bit 6 end,
/// low 5 bits the original NAL type. FU-B additionally carries a DON
/// word, hence the larger minimum length.
fn classify_fu(payload: &[u8], min_len: usize) -> Classified {
    if payload.len() < min_len {
        return Classified::FragmentInterior;
    }
    let fu = FuHeader::parse(payload[1]);
    let kind = NalKind::from_nal_type(fu.nal_type);
    if fu.start {
        Classified::FragmentStart(kind)
    } else if fu.end {
        Classified::FragmentEnd(kind)
    } else {
        Classified::FragmentInterior
    }
}

#[derive(Copy, Clone, Debug)]
struct FuHeader {
    start: bool,
    end: bool,
    nal_type: u8,
}

impl FuHeader {
    fn parse(b: u8) -> Self {
        FuHeader {
            start: (b & 0b1000_0000) != 0,
            end: (b & 0b0100_0000) != 0,
            nal_type: b & 0b0001_1111,
        }
    }
}

/// Why a packet was excluded from reassembly. Nothing is dropped
/// silently; sinks receive one [`Discard`] per exclusion so the capture
/// can be audited afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    EmptyPayload,
    /// Reserved NAL type (30–31), either as the outer type or inside an
    /// FU header.
    ReservedNal(u8),
    /// Whole-stream reassembly ignores everything before the first SPS.
    BeforeParameterSets,
    /// Only the first SPS/PPS pair is retained in the stream.
    DuplicateParameterSet,
    /// Continuation fragment with no fragmentation unit open.
    OrphanFragment,
    /// FU payload too short to carry an FU header.
    TruncatedFragment,
    /// A start fragment arrived while a fragmentation unit was already
    /// open; the unfinished buffer was dropped.
    RestartedFragment,
    /// Packet belongs to a non-video SSRC under the video-only policy.
    NonVideo,
}

impl Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::EmptyPayload => f.write_str("empty payload"),
            DiscardReason::ReservedNal(n) => write!(f, "reserved NAL type ({})", n),
            DiscardReason::BeforeParameterSets => f.write_str("before first SPS"),
            DiscardReason::DuplicateParameterSet => f.write_str("duplicate SPS/PPS"),
            DiscardReason::OrphanFragment => f.write_str("orphaned fragment"),
            DiscardReason::TruncatedFragment => f.write_str("truncated fragment"),
            DiscardReason::RestartedFragment => f.write_str("restarted fragment"),
            DiscardReason::NonVideo => f.write_str("non-video SSRC"),
        }
    }
}

/// One excluded packet, tagged with why.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Discard {
    pub packet_number: u64,
    pub reason: DiscardReason,
}

/// Shared FU-A reassembly state for the per-frame and whole-stream paths.
#[derive(Default)]
struct Defrag {
    out: Vec<u8>,
    /// An open fragmentation unit: start code + synthesized header +
    /// accumulated fragment bodies.
    pending: Option<Vec<u8>>,
}

impl Defrag {
    fn push_single(&mut self, payload: &[u8]) {
        self.out.extend_from_slice(&START_CODE);
        self.out.extend_from_slice(payload);
    }

    fn push_fu(&mut self, packet_number: u64, payload: &[u8], discards: &mut Vec<Discard>) {
        if payload.len() < 2 {
            discards.push(Discard {
                packet_number,
                reason: DiscardReason::TruncatedFragment,
            });
            return;
        }
        let fu = FuHeader::parse(payload[1]);
        let body = &payload[2..];
        if fu.nal_type >= 30 {
            discards.push(Discard {
                packet_number,
                reason: DiscardReason::ReservedNal(fu.nal_type),
            });
            return;
        }
        if fu.start {
            if self.pending.take().is_some() {
                // A start bit while a fragmentation unit is open drops the
                // unfinished buffer. Reported, not silent: it usually
                // means a lost end fragment or reordered delivery.
                debug!(
                    "pkt {}: FU-A start with fragment in progress; dropping unfinished NAL",
                    packet_number
                );
                discards.push(Discard {
                    packet_number,
                    reason: DiscardReason::RestartedFragment,
                });
            }
            // Synthesize the original NAL header: NRI from the fragment
            // indicator, type from the FU header.
            let nri = (payload[0] >> 5) & 0x3;
            let hdr =
                NalHeader::new((nri << 5) | fu.nal_type).expect("header without F bit is valid");
            let mut nal = Vec::with_capacity(4 + body.len());
            nal.extend_from_slice(&START_CODE);
            nal.push(hdr.into());
            nal.extend_from_slice(body);
            self.pending = Some(nal);
        } else if let Some(nal) = self.pending.as_mut() {
            nal.extend_from_slice(body);
        } else {
            discards.push(Discard {
                packet_number,
                reason: DiscardReason::OrphanFragment,
            });
            return;
        }
        if fu.end {
            if let Some(nal) = self.pending.take() {
                self.out.extend_from_slice(&nal);
            }
        }
    }

    /// Flushes an unterminated fragmentation unit: better to keep the
    /// partial slice for inspection than to lose it.
    fn finish(mut self) -> Vec<u8> {
        if let Some(nal) = self.pending.take() {
            self.out.extend_from_slice(&nal);
        }
        self.out
    }
}

/// Reassembles one access unit into a contiguous Annex-B byte stream.
///
/// Packets are taken strictly in arrival order. Reassembly is a pure
/// function of the group: running it twice yields byte-identical output
/// (with the same discards).
pub fn defragment_frame(group: &FrameGroup, discards: &mut Vec<Discard>) -> Bytes {
    let mut d = Defrag::default();
    for pkt in &group.packets {
        let payload = &pkt.payload[..];
        if payload.is_empty() {
            discards.push(Discard {
                packet_number: pkt.packet_number,
                reason: DiscardReason::EmptyPayload,
            });
            continue;
        }
        let nal_type = payload[0] & 0x1f;
        if nal_type >= 30 {
            discards.push(Discard {
                packet_number: pkt.packet_number,
                reason: DiscardReason::ReservedNal(nal_type),
            });
            continue;
        }
        if nal_type == 28 {
            d.push_fu(pkt.packet_number, payload, discards);
        } else {
            d.push_single(payload);
        }
    }
    Bytes::from(d.finish())
}

/// Builds one continuous elementary stream across all frames.
///
/// On top of per-frame reassembly this discards everything before the
/// first SPS and drops any SPS/PPS seen after the first pair, so the
/// output carries exactly one parameter-set prologue.
pub struct StreamDefragmenter {
    inner: Defrag,
    saw_sps: bool,
    saw_pps: bool,
    discards: Vec<Discard>,
}

impl StreamDefragmenter {
    pub fn new() -> Self {
        Self {
            inner: Defrag::default(),
            saw_sps: false,
            saw_pps: false,
            discards: Vec::new(),
        }
    }

    pub fn push(&mut self, packet_number: u64, payload: &[u8]) {
        if payload.is_empty() {
            self.discards.push(Discard {
                packet_number,
                reason: DiscardReason::EmptyPayload,
            });
            return;
        }
        let nal_type = payload[0] & 0x1f;
        if !self.saw_sps && nal_type != 7 {
            self.discards.push(Discard {
                packet_number,
                reason: DiscardReason::BeforeParameterSets,
            });
            return;
        }
        self.saw_sps = true;
        if self.saw_pps && (nal_type == 7 || nal_type == 8) {
            self.discards.push(Discard {
                packet_number,
                reason: DiscardReason::DuplicateParameterSet,
            });
            return;
        }
        if nal_type == 8 {
            self.saw_pps = true;
        }
        if nal_type >= 30 {
            self.discards.push(Discard {
                packet_number,
                reason: DiscardReason::ReservedNal(nal_type),
            });
            return;
        }
        if nal_type == 28 {
            self.inner.push_fu(packet_number, payload, &mut self.discards);
        } else {
            self.inner.push_single(payload);
        }
    }

    /// Returns the elementary stream and every discard recorded along
    /// the way.
    pub fn finish(self) -> (Bytes, Vec<Discard>) {
        (Bytes::from(self.inner.finish()), self.discards)
    }
}

impl Default for StreamDefragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans a reconstructed buffer for 4-byte start codes and returns the
/// SPS/PPS NAL units (start codes included) in encounter order.
pub fn extract_parameter_sets(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] != [0, 0, 0, 1] {
            i += 1;
            continue;
        }
        let mut next = i + 4;
        while next + 4 < data.len() && data[next..next + 4] != [0, 0, 0, 1] {
            next += 1;
        }
        if next + 4 >= data.len() {
            next = data.len();
        }
        let keep = NalHeader::new(data[i + 4]).is_ok_and(|h| {
            matches!(
                h.nal_unit_type(),
                UnitType::SeqParameterSet | UnitType::PicParameterSet
            )
        });
        if keep {
            out.extend_from_slice(&data[i..next]);
        }
        i = next;
    }
    out
}
