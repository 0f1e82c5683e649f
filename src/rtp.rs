// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decodes RTP packets as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::fmt::Display;

use bytes::{Buf, Bytes};

use crate::PacketContext;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: usize = 12;

/// One decoded RTP transport unit.
///
/// Validates the raw buffer once at construction, then exposes accessors
/// over it rather than copying fields out:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The packet owns its bytes and is immutable after parsing; pipeline
/// stages hand it downstream by move. A packet that fails validation is
/// rejected outright; there is no alternate-offset reparse heuristic.
pub struct RtpPacket {
    ctx: PacketContext,

    /// Full packet data, including headers.
    raw: Bytes,

    /// Offset of the payload, past CSRCs and any extension block.
    payload_start: u16,
}

impl RtpPacket {
    /// Parses one interleaved payload into an `RtpPacket`.
    ///
    /// Returns [`MalformedPacketError`] on anything that isn't a plausible
    /// version-2 RTP packet. This is a recoverable condition: the caller
    /// drops the unit and resumes at the next framed unit.
    pub fn parse(ctx: PacketContext, data: Bytes) -> Result<Self, MalformedPacketError> {
        // Interleaved data messages carry a u16 length, so anything longer
        // never came off the wire intact.
        if data.len() > usize::from(u16::MAX) {
            return Err(MalformedPacketError {
                reason: "too long",
                data,
            });
        }
        if data.len() < MIN_HEADER_LEN {
            return Err(MalformedPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(MalformedPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = data[0] & 0b0000_1111;
        let csrc_end = MIN_HEADER_LEN + 4 * usize::from(csrc_count);
        if csrc_end > data.len() {
            return Err(MalformedPacketError {
                reason: "CSRC list is after end of packet",
                data,
            });
        }
        let payload_start = if has_extension {
            if csrc_end + 4 > data.len() {
                return Err(MalformedPacketError {
                    reason: "extension header is after end of packet",
                    data,
                });
            }
            // The last two header bytes give the extension length in
            // 32-bit words, excluding the 4-byte header itself.
            let ext_words = u16::from_be_bytes([data[csrc_end + 2], data[csrc_end + 3]]);
            csrc_end + 4 + 4 * usize::from(ext_words)
        } else {
            csrc_end
        };
        if payload_start > data.len() {
            return Err(MalformedPacketError {
                reason: "extension is after end of packet",
                data,
            });
        }
        Ok(Self {
            ctx,
            raw: data,
            payload_start: payload_start as u16,
        })
    }

    #[inline]
    pub fn ctx(&self) -> &PacketContext {
        &self.ctx
    }

    /// Always 2; other versions are rejected at parse time.
    #[inline]
    pub fn version(&self) -> u8 {
        (self.raw[0] & 0b1100_0000) >> 6
    }

    #[inline]
    pub fn has_padding(&self) -> bool {
        (self.raw[0] & 0b0010_0000) != 0
    }

    #[inline]
    pub fn has_extension(&self) -> bool {
        (self.raw[0] & 0b0001_0000) != 0
    }

    #[inline]
    pub fn csrc_count(&self) -> u8 {
        self.raw[0] & 0b0000_1111
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.raw[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.raw[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.raw[2], self.raw[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.raw[4], self.raw[5], self.raw[6], self.raw[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.raw[8], self.raw[9], self.raw[10], self.raw[11]])
    }

    /// The fixed 12-byte header.
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.raw[..MIN_HEADER_LEN]
    }

    /// The CSRC block; empty when `csrc_count()` is zero.
    #[inline]
    pub fn csrcs(&self) -> &[u8] {
        &self.raw[MIN_HEADER_LEN..MIN_HEADER_LEN + 4 * usize::from(self.csrc_count())]
    }

    /// The extension block (header word included), if present.
    pub fn extension(&self) -> Option<&[u8]> {
        if !self.has_extension() {
            return None;
        }
        let csrc_end = MIN_HEADER_LEN + 4 * usize::from(self.csrc_count());
        Some(&self.raw[csrc_end..usize::from(self.payload_start)])
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw[usize::from(self.payload_start)..]
    }

    /// The raw bytes, including the RTP headers.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw[..]
    }

    /// The interleave channel this packet arrived on.
    #[inline]
    pub fn channel_id(&self) -> u8 {
        self.ctx.channel_id()
    }

    /// Wallclock capture time, microsecond precision.
    #[inline]
    pub fn received_wall(&self) -> crate::WallTime {
        self.ctx.received_wall()
    }

    /// Computed wire size: fixed header + CSRCs + extension (header word
    /// plus data) + payload.
    pub fn wire_size(&self) -> usize {
        let ext = self.extension().map(<[u8]>::len).unwrap_or(0);
        MIN_HEADER_LEN + 4 * usize::from(self.csrc_count()) + ext + self.payload().len()
    }

    /// Appends this packet with its original interleave framing
    /// (`$`, channel, u16 big-endian length, data) to `out`, for raw-dump
    /// sinks that must preserve the byte stream exactly.
    pub fn write_framed(&self, out: &mut Vec<u8>) {
        out.reserve(4 + self.raw.len());
        out.push(b'$');
        out.push(self.channel_id());
        out.extend_from_slice(&(self.raw.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.raw);
    }

    /// Consumes the packet and returns the payload as a [`Bytes`],
    /// without copying.
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw;
        data.advance(usize::from(self.payload_start));
        data
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("ctx", &self.ctx)
            .field("payload_type", &self.payload_type())
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .field("mark", &self.mark())
            .field("payload", &crate::hex::LimitedHex::new(self.payload(), 64))
            .finish()
    }
}

/// A rejected RTP unit: the reason plus the offending bytes, kept for
/// forensic logging.
#[derive(Debug)]
pub struct MalformedPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

impl Display for MalformedPacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "malformed RTP packet ({}): {:?}",
            self.reason,
            crate::hex::LimitedHex::new(&self.data, 32)
        )
    }
}

impl std::error::Error for MalformedPacketError {}

/// Builds valid packets for tests.
#[doc(hidden)]
pub struct RtpPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
    pub ctx: PacketContext,
}

impl RtpPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<RtpPacket, MalformedPacketError> {
        debug_assert!(self.payload_type < 0x80);
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        RtpPacket::parse(self.ctx, data)
    }
}
