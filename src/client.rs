// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking RTSP 1.0 session against one camera.
//!
//! The session speaks the text protocol over TCP for the handshake
//! (`OPTIONS`, `DESCRIBE`, `SETUP`, `PLAY`), then reads interleaved
//! binary data units off the same connection. Everything happens on the
//! caller's thread; socket reads and writes carry a bounded timeout, and
//! a timeout is fatal for the session.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use url::Url;

use crate::error::ErrorInt;
use crate::rtp::RtpPacket;
use crate::{ConnectionContext, Error, PacketContext, WallTime};

/// Bound on every socket read and write.
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Sent with every request.
const USER_AGENT: &str = concat!("ripcap/", env!("CARGO_PKG_VERSION"));

const READ_CHUNK: usize = 8192;

/// Username and password for digest authentication.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the password.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// What one pass over the buffered bytes produced.
enum Parsed {
    Response(rtsp_types::Response<Bytes>),
    /// An interleaved data unit arrived while waiting for a response;
    /// skipped, the stream proper is read via [`RtspSession::read_unit`].
    Data(u8),
    Request,
}

/// One RTSP connection, from TCP connect through the interleaved read
/// loop.
#[derive(Debug)]
pub struct RtspSession {
    stream: TcpStream,
    conn_ctx: ConnectionContext,
    url: Url,
    creds: Option<Credentials>,
    requested_auth: Option<digest_auth::WwwAuthenticateHeader>,
    session_id: Option<String>,

    /// The next `CSeq` header value to use when sending a request.
    next_cseq: u32,

    /// Unparsed bytes read from the socket.
    buf: BytesMut,

    /// Total bytes consumed from the start of the TCP stream; gives every
    /// packet and error a position for cross-referencing a pcap.
    read_pos: u64,

    /// Interleaved units that failed RTP validation and were dropped.
    malformed_packets: u64,

    closed: bool,
}

impl RtspSession {
    /// Opens a TCP connection to the camera named by `url`.
    ///
    /// `rtsp://` only; the port defaults to 554. Credentials embedded in
    /// the URL are extracted (and removed from the request URI) unless
    /// `creds` is given explicitly. No RTSP traffic is sent yet; follow
    /// with [`RtspSession::play`].
    pub fn connect(url: Url, creds: Option<Credentials>) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            bail!(ErrorInt::InvalidArgument(format!(
                "unsupported scheme {:?}; only rtsp is supported",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument("URL has no host".to_owned())))?
            .to_owned();
        let port = url.port().unwrap_or(554);

        let creds = creds.or_else(|| {
            if url.username().is_empty() {
                None
            } else {
                Some(Credentials {
                    username: url.username().to_owned(),
                    password: url.password().unwrap_or("").to_owned(),
                })
            }
        });
        let mut url = url;
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let stream = TcpStream::connect((host.as_str(), port))
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        stream
            .set_write_timeout(Some(IO_TIMEOUT))
            .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        let conn_ctx = ConnectionContext::new(
            stream
                .local_addr()
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
            stream
                .peer_addr()
                .map_err(|e| wrap!(ErrorInt::ConnectError(e)))?,
        );
        debug!("connected: {}", conn_ctx);
        Ok(Self {
            stream,
            conn_ctx,
            url,
            creds,
            requested_auth: None,
            session_id: None,
            next_cseq: 1,
            buf: BytesMut::with_capacity(READ_CHUNK),
            read_pos: 0,
            malformed_packets: 0,
            closed: false,
        })
    }

    pub fn conn_ctx(&self) -> &ConnectionContext {
        &self.conn_ctx
    }

    /// The `Session` id granted by `SETUP`, once [`RtspSession::play`]
    /// has run.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Count of interleaved units dropped as malformed RTP.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets
    }

    /// Performs the full handshake: `OPTIONS`, `DESCRIBE`, `SETUP` of the
    /// video track with interleaved TCP transport, then `PLAY`.
    ///
    /// The `DESCRIBE` body (SDP) is received but deliberately not parsed;
    /// the video track is assumed at `<url>/track1` and the stream is
    /// classified from the packets themselves.
    pub fn play(&mut self) -> Result<(), Error> {
        self.send(
            &mut rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
                .request_uri(self.url.clone())
                .build(Bytes::new()),
        )?;

        let describe = self.send(
            &mut rtsp_types::Request::builder(
                rtsp_types::Method::Describe,
                rtsp_types::Version::V1_0,
            )
            .header(rtsp_types::headers::ACCEPT, "application/sdp")
            .request_uri(self.url.clone())
            .build(Bytes::new()),
        )?;
        trace!("DESCRIBE returned {} byte body", describe.body().len());

        let setup_response = self.send(
            &mut rtsp_types::Request::builder(rtsp_types::Method::Setup, rtsp_types::Version::V1_0)
                .request_uri(self.track_url()?)
                .header(
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP/TCP;unicast;interleaved=0-1",
                )
                .build(Bytes::new()),
        )?;
        // "Session: <id>;timeout=<n>": keep only the id.
        self.session_id = setup_response
            .header(&rtsp_types::headers::SESSION)
            .and_then(|v| v.as_str().split(';').next())
            .map(|s| s.trim().to_owned());
        debug!("SETUP granted session {:?}", self.session_id);

        let mut play = rtsp_types::Request::builder(rtsp_types::Method::Play, rtsp_types::Version::V1_0)
            .request_uri(self.url.clone())
            .header(rtsp_types::headers::RANGE, "npt=0.000-");
        if let Some(s) = self.session_id.as_ref() {
            play = play.header(rtsp_types::headers::SESSION, s.clone());
        }
        self.send(&mut play.build(Bytes::new()))?;
        Ok(())
    }

    /// The video track control URL: `<url>/track1`.
    fn track_url(&self) -> Result<Url, Error> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                wrap!(ErrorInt::InvalidArgument(format!(
                    "can't add track segment to {}",
                    self.url
                )))
            })?
            .pop_if_empty()
            .push("track1");
        Ok(url)
    }

    /// Sends a request and expects the next response from the peer to be
    /// its reply. Takes care of authorization and `CSeq`. On a 401
    /// challenge the request is retried exactly once with digest
    /// authorization; a second 401 is fatal.
    fn send(
        &mut self,
        req: &mut rtsp_types::Request<Bytes>,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        loop {
            let cseq = self.fill_req(req)?;
            let mut serialized = Vec::new();
            req.write(&mut serialized)
                .expect("serializing to a Vec is infallible");
            self.stream.write_all(&serialized).map_err(|e| {
                if is_timeout(&e) {
                    wrap!(ErrorInt::Timeout {
                        conn_ctx: self.conn_ctx,
                    })
                } else {
                    wrap!(ErrorInt::WriteError {
                        conn_ctx: self.conn_ctx,
                        source: e,
                    })
                }
            })?;
            let resp = self.read_response()?;
            if get_cseq(&resp) != Some(cseq) {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    pos: self.read_pos,
                    description: format!(
                        "response CSeq {:?} doesn't match request CSeq {}",
                        resp.header(&rtsp_types::headers::CSEQ).map(|v| v.as_str()),
                        cseq
                    ),
                });
            }
            if resp.status() == rtsp_types::StatusCode::Unauthorized {
                if self.requested_auth.is_some() {
                    bail!(ErrorInt::AuthenticationError {
                        conn_ctx: self.conn_ctx,
                        description: "received Unauthorized after trying digest auth".to_owned(),
                    });
                }
                let www_authenticate = match resp.header(&rtsp_types::headers::WWW_AUTHENTICATE) {
                    None => bail!(ErrorInt::AuthenticationError {
                        conn_ctx: self.conn_ctx,
                        description: "Unauthorized without WWW-Authenticate header".to_owned(),
                    }),
                    Some(h) => h.as_str(),
                };
                if !www_authenticate.starts_with("Digest ") {
                    bail!(ErrorInt::AuthenticationError {
                        conn_ctx: self.conn_ctx,
                        description: format!(
                            "non-digest authentication requested: {}",
                            www_authenticate
                        ),
                    });
                }
                let www_authenticate = digest_auth::WwwAuthenticateHeader::parse(www_authenticate)
                    .map_err(|e| {
                        wrap!(ErrorInt::AuthenticationError {
                            conn_ctx: self.conn_ctx,
                            description: format!("bad WWW-Authenticate header: {}", e),
                        })
                    })?;
                self.requested_auth = Some(www_authenticate);
                continue;
            } else if !resp.status().is_success() {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx: self.conn_ctx,
                    method: req.method().clone(),
                    cseq,
                    status: resp.status(),
                    description: "non-success status".to_owned(),
                });
            }
            return Ok(resp);
        }
    }

    /// Fills out `req` with authorization, `CSeq`, and `User-Agent`
    /// headers.
    fn fill_req(&mut self, req: &mut rtsp_types::Request<Bytes>) -> Result<u32, Error> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        match (self.requested_auth.as_mut(), self.creds.as_ref()) {
            (None, _) => {}
            (Some(auth), Some(creds)) => {
                let uri = req.request_uri().map(|u| u.as_str()).unwrap_or("*");
                let method = digest_auth::HttpMethod(Cow::Borrowed(req.method().into()));
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username,
                    &creds.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    method,
                );
                let authorization = auth
                    .respond(&ctx)
                    .map_err(|e| {
                        wrap!(ErrorInt::AuthenticationError {
                            conn_ctx: self.conn_ctx,
                            description: format!("can't answer digest challenge: {}", e),
                        })
                    })?
                    .to_string();
                req.insert_header(rtsp_types::headers::AUTHORIZATION, authorization);
            }
            (Some(_), None) => bail!(ErrorInt::AuthenticationError {
                conn_ctx: self.conn_ctx,
                description: "authentication required; no credentials supplied".to_owned(),
            }),
        }
        req.insert_header(rtsp_types::headers::CSEQ, cseq.to_string());
        req.insert_header(rtsp_types::headers::USER_AGENT, USER_AGENT.to_owned());
        Ok(cseq)
    }

    /// Reads more bytes into the buffer. `Ok(false)` on a clean EOF.
    fn fill_buf(&mut self) -> Result<bool, Error> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).map_err(|e| {
            if is_timeout(&e) {
                wrap!(ErrorInt::Timeout {
                    conn_ctx: self.conn_ctx,
                })
            } else {
                wrap!(ErrorInt::ReadError {
                    conn_ctx: self.conn_ctx,
                    pos: self.read_pos,
                    source: e,
                })
            }
        })?;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    /// Reads the next RTSP response, skipping interleaved data units that
    /// arrive in between.
    fn read_response(&mut self) -> Result<rtsp_types::Response<Bytes>, Error> {
        loop {
            while self.buf.starts_with(b"\r\n") {
                self.buf.advance(2);
                self.read_pos += 2;
            }
            let (parsed, len) = match rtsp_types::Message::<&[u8]>::parse(&self.buf) {
                Ok((rtsp_types::Message::Response(r), len)) => {
                    let body = Bytes::copy_from_slice(r.body());
                    (Parsed::Response(r.replace_body(body)), len)
                }
                Ok((rtsp_types::Message::Data(d), len)) => (Parsed::Data(d.channel_id()), len),
                Ok((rtsp_types::Message::Request(_), len)) => (Parsed::Request, len),
                Err(rtsp_types::ParseError::Incomplete(_)) => {
                    if !self.fill_buf()? {
                        bail!(ErrorInt::RtspFramingError {
                            conn_ctx: self.conn_ctx,
                            pos: self.read_pos,
                            description: "EOF while waiting for response".to_owned(),
                        });
                    }
                    continue;
                }
                Err(rtsp_types::ParseError::Error) => bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    pos: self.read_pos,
                    description: format!(
                        "invalid RTSP message; buffered:\n{:#?}",
                        crate::hex::LimitedHex::new(&self.buf[..], 128)
                    ),
                }),
            };
            self.buf.advance(len);
            self.read_pos += len as u64;
            match parsed {
                Parsed::Response(r) => return Ok(r),
                Parsed::Data(ch) => trace!("data unit on channel {} while awaiting response", ch),
                Parsed::Request => debug!("ignoring RTSP request from server"),
            }
        }
    }

    /// Reads exactly one interleaved data unit: `$`, channel id, 16-bit
    /// big-endian length, then that many bytes.
    ///
    /// Bytes before the next `$` marker are stray protocol noise and are
    /// skipped one at a time; the skip is a bounded loop so hostile input
    /// can't grow the stack. A clean EOF, or an EOF that truncates the
    /// framing mid-unit, ends the stream with `Ok(None)`.
    fn read_unit(&mut self) -> Result<Option<(PacketContext, Bytes)>, Error> {
        loop {
            let mut noise = 0u64;
            while !self.buf.is_empty() && self.buf[0] != b'$' {
                self.buf.advance(1);
                self.read_pos += 1;
                noise += 1;
            }
            if noise > 0 {
                debug!("skipped {} bytes of non-interleaved data at pos {}", noise, self.read_pos);
            }
            if !self.buf.is_empty() && self.buf.len() >= 4 {
                let channel_id = self.buf[1];
                let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
                if self.buf.len() >= 4 + len {
                    let pos = self.read_pos;
                    let mut unit = self.buf.split_to(4 + len);
                    self.read_pos += (4 + len) as u64;
                    unit.advance(4);
                    let ctx = PacketContext::new(channel_id, pos, WallTime::now());
                    return Ok(Some((ctx, unit.freeze())));
                }
            }
            if !self.fill_buf()? {
                if !self.buf.is_empty() {
                    debug!(
                        "EOF with {} bytes of truncated framing at pos {}",
                        self.buf.len(),
                        self.read_pos
                    );
                }
                return Ok(None);
            }
        }
    }

    /// Returns the next well-formed RTP packet, or `None` at end of
    /// stream. Units that fail RTP validation are counted, logged, and
    /// dropped; the read loop resumes at the next framed unit.
    pub fn next_packet(&mut self) -> Result<Option<RtpPacket>, Error> {
        while let Some((ctx, data)) = self.read_unit()? {
            match RtpPacket::parse(ctx, data) {
                Ok(p) => return Ok(Some(p)),
                Err(e) => {
                    self.malformed_packets += 1;
                    debug!("[{}] dropping unit: {}", ctx, e);
                }
            }
        }
        Ok(None)
    }

    /// Shuts the connection down. Idempotent; also run on drop.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer may already have torn the connection down.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(wrap!(ErrorInt::WriteError {
                conn_ctx: self.conn_ctx,
                source: e,
            })),
        }
    }
}

impl Drop for RtspSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing RTSP session: {}", e);
        }
    }
}

/// Returns the `CSeq` of a response as a `u32`, or `None` if
/// missing/unparseable.
fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().parse::<u32>().ok())
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    /// Reads one header-only RTSP request and returns (method line,
    /// headers).
    fn read_request(r: &mut impl BufRead) -> (String, Vec<String>) {
        let mut line = String::new();
        r.read_line(&mut line).unwrap();
        let request_line = line.trim_end().to_owned();
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            headers.push(line.to_owned());
        }
        (request_line, headers)
    }

    fn cseq_of(headers: &[String]) -> &str {
        headers
            .iter()
            .find_map(|h| h.strip_prefix("CSeq: "))
            .unwrap()
    }

    fn header_of<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find_map(|h| h.strip_prefix(&format!("{}: ", name)))
    }

    fn respond(w: &mut impl Write, cseq: &str, extra: &str) {
        write!(w, "RTSP/1.0 200 OK\r\nCSeq: {}\r\n{}\r\n", cseq, extra).unwrap();
    }

    fn framed(payload_type: u8, seq: u16, timestamp: u32) -> Vec<u8> {
        let p = RtpPacketBuilder {
            sequence_number: seq,
            timestamp,
            payload_type,
            ssrc: 0xabcd,
            mark: false,
            ctx: PacketContext::dummy(),
        }
        .build(b"\x65\x00".iter().copied())
        .unwrap();
        let mut out = Vec::new();
        p.write_framed(&mut out);
        out
    }

    /// Full scripted session: digest challenge on OPTIONS, handshake,
    /// then interleaved data with interspersed noise and a truncated
    /// trailing unit.
    #[test]
    fn handshake_and_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut r = BufReader::new(sock.try_clone().unwrap());
            let mut w = sock;

            // OPTIONS: challenge, then accept the authorized retry.
            let (line, headers) = read_request(&mut r);
            assert!(line.starts_with("OPTIONS "));
            assert!(header_of(&headers, "Authorization").is_none());
            write!(
                w,
                "RTSP/1.0 401 Unauthorized\r\nCSeq: {}\r\n\
                 WWW-Authenticate: Digest realm=\"cam\", nonce=\"0123456789abcdef\"\r\n\r\n",
                cseq_of(&headers)
            )
            .unwrap();
            let (line, headers) = read_request(&mut r);
            assert!(line.starts_with("OPTIONS "));
            let auth = header_of(&headers, "Authorization").unwrap();
            assert!(auth.starts_with("Digest "));
            assert!(auth.contains("username=\"admin\""));
            respond(&mut w, cseq_of(&headers), "");

            let (line, headers) = read_request(&mut r);
            assert!(line.starts_with("DESCRIBE "));
            assert_eq!(header_of(&headers, "Accept"), Some("application/sdp"));
            assert!(header_of(&headers, "Authorization").is_some());
            let sdp = "v=0\r\n";
            write!(
                w,
                "RTSP/1.0 200 OK\r\nCSeq: {}\r\nContent-Type: application/sdp\r\n\
                 Content-Length: {}\r\n\r\n{}",
                cseq_of(&headers),
                sdp.len(),
                sdp
            )
            .unwrap();

            let (line, headers) = read_request(&mut r);
            assert!(line.starts_with("SETUP "));
            assert!(line.contains("/track1 "));
            assert_eq!(
                header_of(&headers, "Transport"),
                Some("RTP/AVP/TCP;unicast;interleaved=0-1")
            );
            respond(&mut w, cseq_of(&headers), "Session: 12345678;timeout=60\r\n");

            let (line, headers) = read_request(&mut r);
            assert!(line.starts_with("PLAY "));
            assert_eq!(header_of(&headers, "Session"), Some("12345678"));
            assert_eq!(header_of(&headers, "Range"), Some("npt=0.000-"));
            respond(&mut w, cseq_of(&headers), "");

            // Two data units with noise between them, one malformed unit,
            // and truncated framing at the very end.
            w.write_all(&framed(96, 1, 1000)).unwrap();
            w.write_all(b"\r\nRTSP noise").unwrap();
            w.write_all(b"$\x00\x00\x03abc").unwrap(); // too short for RTP
            w.write_all(&framed(96, 2, 1000)).unwrap();
            w.write_all(b"$\x00").unwrap();
        });

        let url = Url::parse(&format!("rtsp://admin:secret@{}/stream", addr)).unwrap();
        let mut session = RtspSession::connect(url, None).unwrap();
        session.play().unwrap();
        assert_eq!(session.session_id(), Some("12345678"));

        let p1 = session.next_packet().unwrap().unwrap();
        assert_eq!(p1.sequence_number(), 1);
        assert_eq!(p1.channel_id(), 0);
        let p2 = session.next_packet().unwrap().unwrap();
        assert_eq!(p2.sequence_number(), 2);
        // The malformed unit was counted, and truncated trailing framing
        // is a graceful end of stream.
        assert!(session.next_packet().unwrap().is_none());
        assert_eq!(session.malformed_packets(), 1);
        session.close().unwrap();
        session.close().unwrap(); // idempotent
        server.join().unwrap();
    }

    #[test]
    fn second_unauthorized_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let mut r = BufReader::new(sock.try_clone().unwrap());
            let mut w = sock;
            for _ in 0..2 {
                let (_, headers) = read_request(&mut r);
                write!(
                    w,
                    "RTSP/1.0 401 Unauthorized\r\nCSeq: {}\r\n\
                     WWW-Authenticate: Digest realm=\"cam\", nonce=\"feed\"\r\n\r\n",
                    cseq_of(&headers)
                )
                .unwrap();
            }
        });

        let url = Url::parse(&format!("rtsp://admin:wrong@{}/stream", addr)).unwrap();
        let mut session = RtspSession::connect(url, None).unwrap();
        let e = session.play().unwrap_err();
        assert!(e.is_authentication(), "unexpected error: {}", e);
        server.join().unwrap();
    }

    #[test]
    fn rejects_non_rtsp_url() {
        let url = Url::parse("http://example.com/").unwrap();
        let e = RtspSession::connect(url, None).unwrap_err();
        assert!(e.to_string().contains("only rtsp is supported"));
    }
}
