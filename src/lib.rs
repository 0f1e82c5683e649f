// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forensic RTSP/RTP capture library.
//!
//! `ripcap` connects to an IP camera over RTSP 1.0, reads the interleaved
//! RTP stream over the same TCP connection, classifies every packet, and
//! reassembles fragmented H.264 NAL units into decodable access units.
//! The focus is diagnostic fidelity rather than playback: every packet is
//! accounted for, including the ones a decoder would never see, and every
//! discard carries a reason.
//!
//! The pipeline is strictly one-directional and single-threaded:
//! socket bytes → [`rtp::RtpPacket`] → [`classify::Classifier`] →
//! [`codec::FrameGrouper`] / [`codec::h264`] reassembly → caller sinks.
//! Run one independent [`client::RtspSession`] per camera; nothing is
//! shared between sessions.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::{Debug, Display};
use std::net::SocketAddr;

mod error;
mod hex;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod capture;
pub mod classify;
pub mod client;
pub mod codec;
pub mod rtp;

/// A wallclock time with microsecond precision.
///
/// Stored as microseconds since the Unix epoch. This is the capture-side
/// "evidence clock": it records when a packet was pulled off the socket,
/// not anything the camera claims. The `Display` impl renders UTC for log
/// readability; sinks that serialize should use [`WallTime::as_micros`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WallTime(i64);

impl WallTime {
    pub fn now() -> Self {
        WallTime(chrono::Utc::now().timestamp_micros())
    }

    /// Microseconds since the Unix epoch.
    #[inline]
    pub fn as_micros(&self) -> i64 {
        self.0
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_micros(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%FT%T%.6fZ")),
            None => write!(f, "{}us", self.0),
        }
    }
}

impl Debug for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// Identifies an RTSP connection for error messages.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::from(([0, 0, 0, 0], 0));
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime(0),
        }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}@{}",
            self.local_addr, self.peer_addr, self.established_wall
        )
    }
}

/// Identifies one interleaved data unit within an RTSP connection:
/// which channel it arrived on, its byte position within the TCP stream,
/// and when it was read.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketContext {
    channel_id: u8,
    stream_pos: u64,
    received_wall: WallTime,
}

impl PacketContext {
    pub fn new(channel_id: u8, stream_pos: u64, received_wall: WallTime) -> Self {
        Self {
            channel_id,
            stream_pos,
            received_wall,
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self {
            channel_id: 0,
            stream_pos: 0,
            received_wall: WallTime(0),
        }
    }

    /// The RTSP interleave channel id (0–3 in practice).
    #[inline]
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Byte position of the `$` framing marker within the TCP stream.
    #[inline]
    pub fn stream_pos(&self) -> u64 {
        self.stream_pos
    }

    /// Wallclock time at which the unit was read from the socket.
    #[inline]
    pub fn received_wall(&self) -> WallTime {
        self.received_wall
    }
}

impl Display for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ch={} pos={} at {}",
            self.channel_id, self.stream_pos, self.received_wall
        )
    }
}
