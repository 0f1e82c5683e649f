// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::ConnectionContext;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Every variant carries enough context (connection endpoints, stream
/// position, CSeq) to locate the offending bytes in a packet capture.
/// Only fatal conditions become an `Error`; recoverable ones (a malformed
/// RTP unit, a dropped fragment) are absorbed by the pipeline and
/// reported through [`crate::rtp::MalformedPacketError`] and
/// [`crate::codec::h264::Discard`] instead.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// True iff this is a (fatal) authentication failure.
    pub fn is_authentication(&self) -> bool {
        matches!(*self.0, ErrorInt::AuthenticationError { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    /// The bounded socket timeout elapsed. Fatal for the session; the
    /// capture loop never retries a timed-out read.
    #[error("[{conn_ctx}] Timeout")]
    Timeout { conn_ctx: ConnectionContext },

    #[error("[{conn_ctx}, pos={pos}] Error reading from RTSP peer: {source}")]
    ReadError {
        conn_ctx: ConnectionContext,
        pos: u64,
        source: std::io::Error,
    },

    #[error("[{conn_ctx}] Error writing to RTSP peer: {source}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    /// Unparseable RTSP message on the control channel.
    #[error("[{conn_ctx}, pos={pos}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        pos: u64,
        description: String,
    },

    #[error("[{conn_ctx}] {status} response to {} CSeq={cseq}: {description}",
            Into::<&str>::into(.method))]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    /// The server rejected our credentials: a second 401 after the single
    /// digest retry, a challenge we can't answer, or a challenge with no
    /// credentials supplied.
    #[error("[{conn_ctx}] Authentication failed: {description}")]
    AuthenticationError {
        conn_ctx: ConnectionContext,
        description: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_predicate() {
        let e = Error(Arc::new(ErrorInt::AuthenticationError {
            conn_ctx: ConnectionContext::dummy(),
            description: "second Unauthorized".into(),
        }));
        assert!(e.is_authentication());
        let e = Error(Arc::new(ErrorInt::InvalidArgument("nope".into())));
        assert!(!e.is_authentication());
    }
}
