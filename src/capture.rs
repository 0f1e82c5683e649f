// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The capture loop: pulls packets from a session, classifies them,
//! selects the video stream by SSRC, and reassembles frames.
//!
//! All stages run on the caller's thread. Observers plug in through
//! [`CaptureSink`]; the loop itself never writes files or prints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info};

use crate::classify::{Classifier, DeviationStats, PacketAnalysis};
use crate::client::RtspSession;
use crate::codec::h264::{self, Discard, DiscardReason, StreamDefragmenter};
use crate::codec::{FrameGroup, FrameGrouper};
use crate::rtp::RtpPacket;
use crate::Error;

/// Packets sampled before committing to a video SSRC.
const SSRC_SAMPLE_LEN: u64 = 100;

/// Anything that yields RTP packets in arrival order.
///
/// [`RtspSession`] is the production source; tests substitute canned
/// packet vectors.
pub trait PacketSource {
    fn next_packet(&mut self) -> Result<Option<RtpPacket>, Error>;
}

impl PacketSource for RtspSession {
    fn next_packet(&mut self) -> Result<Option<RtpPacket>, Error> {
        RtspSession::next_packet(self)
    }
}

/// Observer hooks for the capture pipeline. All methods default to
/// no-ops; implement only what the sink cares about.
pub trait CaptureSink {
    /// Called once per received packet, video or not, in arrival order.
    fn on_packet(&mut self, _pkt: &RtpPacket, _analysis: &PacketAnalysis) {}

    /// Called once per completed access unit with its reassembled
    /// Annex-B bytes.
    fn on_frame(&mut self, _group: &FrameGroup, _data: &[u8]) {}

    /// Called for each packet excluded from frame reassembly.
    fn on_discard(&mut self, _discard: &Discard) {}
}

/// A sink that ignores everything; useful when only the
/// [`CaptureSummary`] matters.
pub struct NullSink;

impl CaptureSink for NullSink {}

/// Bounds on a capture run. The default has no bounds: capture until the
/// server closes the stream.
#[derive(Clone, Default)]
pub struct CaptureOptions {
    /// Stop after this much wall time.
    pub max_duration: Option<Duration>,

    /// Stop after receiving this many packets.
    pub max_packets: Option<u64>,

    /// Externally-owned stop flag, checked between packets. Lets a signal
    /// handler or another thread end the capture cleanly.
    pub stop: Option<Arc<AtomicBool>>,
}

/// What a finished capture produced.
pub struct CaptureSummary {
    /// Total packets received, all SSRCs.
    pub packets: u64,

    /// Packets attributed to the selected video SSRC.
    pub video_packets: u64,

    /// Access units handed to [`CaptureSink::on_frame`].
    pub frames: u64,

    /// The selected video SSRC, if any video packets were seen.
    pub video_ssrc: Option<u32>,

    /// One continuous Annex-B elementary stream across the whole capture,
    /// with a single SPS/PPS prologue.
    pub elementary_stream: Bytes,

    /// Packets the whole-stream reassembly excluded. Per-frame discards
    /// go to [`CaptureSink::on_discard`] as they happen; these are the
    /// stream-level ones (pre-SPS, duplicate parameter sets, and the
    /// stream pass's own fragment drops).
    pub stream_discards: Vec<Discard>,

    /// Inter-frame timing jitter over the whole capture.
    pub deviation_stats: DeviationStats,
}

impl CaptureSummary {
    /// The SPS/PPS NAL units of the elementary stream, for sinks that
    /// save decoder configuration separately.
    pub fn parameter_sets(&self) -> Vec<u8> {
        h264::extract_parameter_sets(&self.elementary_stream)
    }
}

/// Picks the video SSRC by majority vote over the first
/// [`SSRC_SAMPLE_LEN`] packets.
///
/// Cameras commonly interleave audio, video, and RTCP on one connection;
/// the SSRC carrying the most video-typed packets early on is the video
/// stream. A capture shorter than the sample is finalized at end of
/// stream instead, so short runs still select a stream.
struct VideoSsrcSelector {
    sampled: u64,
    /// Counts in first-seen order, so ties break deterministically.
    counts: Vec<(u32, u64)>,
    chosen: Option<u32>,
    done: bool,
}

impl VideoSsrcSelector {
    fn new() -> Self {
        Self {
            sampled: 0,
            counts: Vec::new(),
            chosen: None,
            done: false,
        }
    }

    fn observe(&mut self, payload_type: u8, ssrc: u32) {
        if self.done {
            return;
        }
        if is_video_type(payload_type) {
            match self.counts.iter_mut().find(|(s, _)| *s == ssrc) {
                Some((_, n)) => *n += 1,
                None => self.counts.push((ssrc, 1)),
            }
        }
        self.sampled += 1;
        if self.sampled == SSRC_SAMPLE_LEN {
            self.finalize();
        }
    }

    fn finalize(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut best: Option<(u32, u64)> = None;
        for &(ssrc, n) in &self.counts {
            if best.map_or(true, |(_, bn)| n > bn) {
                best = Some((ssrc, n));
            }
        }
        self.chosen = best.map(|(ssrc, _)| ssrc);
        debug!(
            "selected video SSRC {:?} after {} packets",
            self.chosen.map(|s| format!("{:08x}", s)),
            self.sampled
        );
    }
}

fn is_video_type(pt: u8) -> bool {
    matches!(pt, 96 | 97 | 189)
}

/// A video packet held back until the SSRC vote closes, or flowing
/// through the reassembly stages afterwards.
struct BufferedPacket {
    packet_number: u64,
    ssrc: u32,
    rtp_timestamp: u32,
    payload: Bytes,
}

/// Runs a capture until the source ends or an option bound trips.
///
/// Every packet is classified and reported via
/// [`CaptureSink::on_packet`] immediately. Reassembly is gated on the
/// SSRC vote: packets buffer until a video SSRC is chosen, then drain
/// through frame grouping, per-frame reassembly, and the whole-stream
/// pass. Packets on other SSRCs surface as `NonVideo` discards.
pub fn run(
    source: &mut dyn PacketSource,
    options: &CaptureOptions,
    sink: &mut dyn CaptureSink,
) -> Result<CaptureSummary, Error> {
    let start = Instant::now();
    let mut classifier = Classifier::new();
    let mut selector = VideoSsrcSelector::new();
    let mut grouper = FrameGrouper::new();
    let mut stream_defrag = StreamDefragmenter::new();
    let mut held: Vec<BufferedPacket> = Vec::new();

    let mut packets = 0u64;
    let mut video_packets = 0u64;
    let mut frames = 0u64;

    loop {
        if let Some(stop) = options.stop.as_ref() {
            if stop.load(Ordering::Relaxed) {
                debug!("stop flag set; ending capture");
                break;
            }
        }
        if options.max_packets.is_some_and(|max| packets >= max) {
            debug!("reached max_packets={}; ending capture", packets);
            break;
        }
        if options
            .max_duration
            .is_some_and(|max| start.elapsed() >= max)
        {
            debug!("reached max_duration; ending capture");
            break;
        }

        let pkt = match source.next_packet()? {
            Some(p) => p,
            None => break,
        };
        packets += 1;
        let analysis = classifier.analyze(&pkt);
        sink.on_packet(&pkt, &analysis);

        selector.observe(analysis.payload_type, analysis.ssrc);
        let buffered = BufferedPacket {
            packet_number: analysis.packet_number,
            ssrc: analysis.ssrc,
            rtp_timestamp: analysis.rtp_timestamp,
            payload: pkt.into_payload_bytes(),
        };
        if selector.done {
            for held_pkt in held.drain(..) {
                process(
                    held_pkt,
                    selector.chosen,
                    &mut grouper,
                    &mut stream_defrag,
                    sink,
                    &mut video_packets,
                    &mut frames,
                );
            }
            process(
                buffered,
                selector.chosen,
                &mut grouper,
                &mut stream_defrag,
                sink,
                &mut video_packets,
                &mut frames,
            );
        } else {
            held.push(buffered);
        }
    }

    // A capture shorter than the sample window still gets a selection.
    selector.finalize();
    for held_pkt in held.drain(..) {
        process(
            held_pkt,
            selector.chosen,
            &mut grouper,
            &mut stream_defrag,
            sink,
            &mut video_packets,
            &mut frames,
        );
    }
    if let Some(group) = grouper.finish() {
        emit_frame(&group, sink, &mut frames);
    }

    let (elementary_stream, stream_discards) = stream_defrag.finish();
    info!(
        "capture done: {} packets ({} video), {} frames, {} stream bytes",
        packets,
        video_packets,
        frames,
        elementary_stream.len()
    );
    Ok(CaptureSummary {
        packets,
        video_packets,
        frames,
        video_ssrc: selector.chosen,
        elementary_stream,
        stream_discards,
        deviation_stats: *classifier.deviation_stats(),
    })
}

fn process(
    pkt: BufferedPacket,
    video_ssrc: Option<u32>,
    grouper: &mut FrameGrouper,
    stream_defrag: &mut StreamDefragmenter,
    sink: &mut dyn CaptureSink,
    video_packets: &mut u64,
    frames: &mut u64,
) {
    if video_ssrc != Some(pkt.ssrc) {
        sink.on_discard(&Discard {
            packet_number: pkt.packet_number,
            reason: DiscardReason::NonVideo,
        });
        return;
    }
    *video_packets += 1;
    stream_defrag.push(pkt.packet_number, &pkt.payload);
    if let Some(group) = grouper.push(pkt.packet_number, pkt.rtp_timestamp, pkt.payload) {
        emit_frame(&group, sink, frames);
    }
}

fn emit_frame(group: &FrameGroup, sink: &mut dyn CaptureSink, frames: &mut u64) {
    let mut discards = Vec::new();
    let data = h264::defragment_frame(group, &mut discards);
    for d in &discards {
        sink.on_discard(d);
    }
    sink.on_frame(group, &data);
    *frames += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpPacketBuilder;
    use crate::PacketContext;

    struct VecSource(std::vec::IntoIter<RtpPacket>);

    impl PacketSource for VecSource {
        fn next_packet(&mut self) -> Result<Option<RtpPacket>, Error> {
            Ok(self.0.next())
        }
    }

    fn pkt(seq: u16, timestamp: u32, pt: u8, ssrc: u32, payload: &[u8]) -> RtpPacket {
        RtpPacketBuilder {
            sequence_number: seq,
            timestamp,
            payload_type: pt,
            ssrc,
            mark: false,
            ctx: PacketContext::dummy(),
        }
        .build(payload.iter().copied())
        .unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        packets: Vec<PacketAnalysis>,
        frames: Vec<Vec<u8>>,
        discards: Vec<Discard>,
    }

    impl CaptureSink for RecordingSink {
        fn on_packet(&mut self, _pkt: &RtpPacket, analysis: &PacketAnalysis) {
            self.packets.push(analysis.clone());
        }

        fn on_frame(&mut self, _group: &FrameGroup, data: &[u8]) {
            self.frames.push(data.to_vec());
        }

        fn on_discard(&mut self, discard: &Discard) {
            self.discards.push(*discard);
        }
    }

    const VIDEO: u32 = 0xaaaa;
    const AUDIO: u32 = 0xbbbb;

    fn mixed_stream() -> VecSource {
        VecSource(
            vec![
                pkt(1, 1000, 96, VIDEO, b"\x67sps"),
                pkt(2, 1000, 96, VIDEO, b"\x68pps"),
                pkt(100, 800, 0, AUDIO, b"\x01\x02"),
                pkt(3, 2000, 96, VIDEO, b"\x7c\x85idr1"),
                pkt(4, 2000, 96, VIDEO, b"\x7c\x45idr2"),
                pkt(101, 960, 0, AUDIO, b"\x03\x04"),
                pkt(5, 3000, 96, VIDEO, b"\x61p"),
            ]
            .into_iter(),
        )
    }

    #[test]
    fn short_capture_selects_ssrc_at_eof() {
        let mut sink = RecordingSink::default();
        let summary = run(&mut mixed_stream(), &CaptureOptions::default(), &mut sink).unwrap();
        assert_eq!(summary.packets, 7);
        assert_eq!(summary.video_packets, 5);
        assert_eq!(summary.video_ssrc, Some(VIDEO));
        // Three access units: SPS+PPS, reassembled IDR, P slice.
        assert_eq!(summary.frames, 3);
        assert_eq!(sink.frames.len(), 3);
        assert_eq!(
            &sink.frames[0][..],
            b"\x00\x00\x01\x67sps\x00\x00\x01\x68pps"
        );
        assert_eq!(&sink.frames[1][..], b"\x00\x00\x01\x65idr1idr2");
        assert_eq!(&sink.frames[2][..], b"\x00\x00\x01\x61p");
        // Every packet was reported, audio included.
        assert_eq!(sink.packets.len(), 7);
        // The audio packets surface as non-video discards.
        let non_video: Vec<u64> = sink
            .discards
            .iter()
            .filter(|d| d.reason == DiscardReason::NonVideo)
            .map(|d| d.packet_number)
            .collect();
        assert_eq!(non_video, vec![3, 6]);
    }

    #[test]
    fn elementary_stream_and_parameter_sets() {
        let summary = run(&mut mixed_stream(), &CaptureOptions::default(), &mut NullSink).unwrap();
        assert_eq!(
            &summary.elementary_stream[..],
            b"\x00\x00\x01\x67sps\x00\x00\x01\x68pps\x00\x00\x01\x65idr1idr2\x00\x00\x01\x61p"
        );
        assert!(summary.stream_discards.is_empty());
        // 3-byte start codes in the stream mean no 4-byte-delimited
        // parameter sets to extract here.
        assert!(summary.parameter_sets().is_empty());
    }

    #[test]
    fn stream_pass_waits_for_sps() {
        // An IDR slice before any SPS reaches frames but not the
        // elementary stream.
        let mut source = VecSource(
            vec![
                pkt(1, 1000, 96, VIDEO, b"\x65early"),
                pkt(2, 2000, 96, VIDEO, b"\x67sps"),
                pkt(3, 2000, 96, VIDEO, b"\x68pps"),
            ]
            .into_iter(),
        );
        let mut sink = RecordingSink::default();
        let summary = run(&mut source, &CaptureOptions::default(), &mut sink).unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(
            &summary.elementary_stream[..],
            b"\x00\x00\x01\x67sps\x00\x00\x01\x68pps"
        );
        assert_eq!(summary.stream_discards.len(), 1);
        assert_eq!(
            summary.stream_discards[0].reason,
            DiscardReason::BeforeParameterSets
        );
    }

    #[test]
    fn max_packets_bound() {
        let options = CaptureOptions {
            max_packets: Some(2),
            ..Default::default()
        };
        let summary = run(&mut mixed_stream(), &options, &mut NullSink).unwrap();
        assert_eq!(summary.packets, 2);
        assert_eq!(summary.video_ssrc, Some(VIDEO));
    }

    #[test]
    fn stop_flag_ends_capture() {
        let stop = Arc::new(AtomicBool::new(true));
        let options = CaptureOptions {
            stop: Some(stop),
            ..Default::default()
        };
        let summary = run(&mut mixed_stream(), &options, &mut NullSink).unwrap();
        assert_eq!(summary.packets, 0);
        assert_eq!(summary.video_ssrc, None);
    }

    #[test]
    fn selection_commits_after_sample_window() {
        // 100 packets of majority video plus a competing SSRC; the vote
        // closes at the window and reassembly proceeds without buffering.
        let mut packets = Vec::new();
        for i in 0..98u16 {
            packets.push(pkt(i, 1000 + u32::from(i) * 3600, 96, VIDEO, b"\x61p"));
        }
        packets.push(pkt(200, 500, 96, 0xcccc, b"\x61q"));
        packets.push(pkt(201, 600, 0, AUDIO, b"\x01\x02"));
        // Past the window now.
        packets.push(pkt(98, 1000 + 98 * 3600, 96, VIDEO, b"\x61p"));
        let mut source = VecSource(packets.into_iter());
        let mut sink = RecordingSink::default();
        let summary = run(&mut source, &CaptureOptions::default(), &mut sink).unwrap();
        assert_eq!(summary.video_ssrc, Some(VIDEO));
        assert_eq!(summary.video_packets, 99);
        assert_eq!(summary.frames, 99);
    }
}
