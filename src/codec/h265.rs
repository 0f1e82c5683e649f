// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265) payload classification
//! per [RFC 7798](https://tools.ietf.org/html/rfc7798).
//!
//! Classification only; reassembly is H.264-specific. The payload header
//! is two bytes, with the 6-bit NAL unit type in bits 1..7 of the first:
//!
//! ```text
//! +---------------+---------------+
//! |0|1|2|3|4|5|6|7|0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|   Type    |  LayerId  | TID |
//! +-------------+-----------------+
//! ```

use std::fmt::Display;

/// Coarse H.265 NAL unit kinds, bucketing the leading slice types by
/// picture role rather than enumerating all 64 codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NalKind {
    BFrame,
    PFrame,
    IFrame,
    Vps,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Sei,
    Other(u8),
}

impl NalKind {
    /// Maps a 6-bit NAL unit type to its kind.
    pub fn from_nal_type(nal_type: u8) -> Self {
        match nal_type {
            0..=1 => NalKind::BFrame,
            2..=4 => NalKind::PFrame,
            5..=7 => NalKind::IFrame,
            32 => NalKind::Vps,
            33 => NalKind::Sps,
            34 => NalKind::Pps,
            35 => NalKind::AccessUnitDelimiter,
            39 => NalKind::Sei,
            n => NalKind::Other(n),
        }
    }
}

impl Display for NalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalKind::BFrame => f.write_str("B-frame"),
            NalKind::PFrame => f.write_str("P-frame"),
            NalKind::IFrame => f.write_str("I-frame"),
            NalKind::Vps => f.write_str("VPS"),
            NalKind::Sps => f.write_str("SPS"),
            NalKind::Pps => f.write_str("PPS"),
            NalKind::AccessUnitDelimiter => f.write_str("AUD"),
            NalKind::Sei => f.write_str("SEI"),
            NalKind::Other(n) => write!(f, "H265-NAL-{}", n),
        }
    }
}

/// Classifies one RTP payload. Payloads too short to carry the two-byte
/// payload header plus any body yield `None`.
pub(crate) fn classify(payload: &[u8]) -> Option<NalKind> {
    if payload.len() < 3 {
        return None;
    }
    Some(NalKind::from_nal_type((payload[0] >> 1) & 0x3f))
}
