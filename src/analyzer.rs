//! The per-segment entry point: flow lookup, sequence analysis, reassembly
//! and follow-stream bookkeeping, plus the caches that make later passes
//! read-only.

use ahash::AHashMap;
use serde::Serialize;
use std::ops::Range;

use crate::analysis::{AnalysisFlags, Annotation, SequenceAnalyzer};
use crate::config::{AnalysisConfig, Config};
use crate::direction::{Direction, EarlySegment};
use crate::error::SegmentError;
use crate::flow::{Flow, FlowDirection, FlowDirectory, FlowSnapshot, StreamId};
use crate::follow::FollowRecord;
use crate::reassembly::{Disposition, PduConsumer, Reassembler, RecordedPdu, SegmentInput};
use crate::segment::{FrameId, Segment};
use crate::seq;

/// One segment occurrence: a frame can carry the same segment more than
/// once (tunnels), told apart by seq/ack.
type OccurrenceKey = (FrameId, u32, u32);

/// Everything reported for one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentReport {
    pub frame: FrameId,
    pub stream: StreamId,
    pub direction: FlowDirection,
    /// Relative or absolute, per configuration.
    pub seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u32>,
    pub next_seq: u32,
    pub seglen: u32,
    /// Advertised window after scaling.
    pub window_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_relative: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_delta: Option<f64>,
    pub annotation: Annotation,
    pub disposition: Disposition,
}

pub struct Analyzer {
    analysis: AnalysisConfig,
    sequence: SequenceAnalyzer,
    reassembler: Reassembler,
    directory: FlowDirectory,
    reports: AHashMap<OccurrenceKey, SegmentReport>,
    /// Every consumer invocation of the first pass, in order.
    log: Vec<RecordedPdu>,
    occurrences: AHashMap<OccurrenceKey, Range<usize>>,
    flushed: Vec<Range<usize>>,
}

impl Analyzer {
    pub fn new(config: &Config) -> Self {
        Analyzer {
            analysis: config.analysis.clone(),
            sequence: SequenceAnalyzer::new(config.analysis.clone()),
            reassembler: Reassembler::new(config.reassembly.clone()),
            directory: FlowDirectory::new(),
            reports: AHashMap::new(),
            log: Vec::new(),
            occurrences: AHashMap::new(),
            flushed: Vec::new(),
        }
    }

    /// Analyze one segment. On the first pass state is updated and the
    /// result cached; on later passes the cached report is returned and the
    /// deliveries recorded for this occurrence are replayed to `consumer`.
    pub fn process(
        &mut self,
        segment: &Segment,
        first_pass: bool,
        consumer: &mut dyn PduConsumer,
    ) -> Result<SegmentReport, SegmentError> {
        let key = (segment.frame, segment.seq, segment.ack);
        if !first_pass {
            return self.replay(key, consumer);
        }
        if let Some(report) = self.reports.get(&key) {
            return Ok(report.clone());
        }

        segment.validate()?;
        let resolved = self.directory.resolve(segment)?;
        let direction = resolved.direction;
        let flow = self
            .directory
            .get_mut(resolved.stream)
            .ok_or(SegmentError::NotAnalyzed {
                frame: segment.frame,
            })?;

        let (time_relative, time_delta) = flow.observe(segment, direction);
        let from_initiator = flow.initiator() == Some(direction);
        let config = self.reassembler.config();
        let cap = config.max_out_of_order_segments;
        let holds_early = config.enabled && config.out_of_order;

        let (fwd, rev, handshake) = flow.split(direction);
        self.sequence
            .observe_handshake(segment, fwd, rev, handshake, from_initiator);
        let initial_rtt = handshake.initial_rtt();

        let mut annotation = if self.analysis.analyze_sequence {
            self.sequence.analyze(segment, fwd, rev, initial_rtt)
        } else {
            Annotation {
                initial_rtt,
                ..Annotation::default()
            }
        };
        if resolved.reused_ports {
            annotation.flags |= AnalysisFlags::REUSED_PORTS;
        }

        let forward = Feeder {
            reassembler: &self.reassembler,
            stream: resolved.stream,
            direction,
            follow_cap: cap,
        };
        let backward = Feeder {
            direction: direction.reverse(),
            ..forward
        };
        let mut delivered = Vec::new();
        let mut follow = Vec::new();
        let mut sink = Sink {
            consumer,
            delivered: &mut delivered,
            follow: &mut follow,
        };

        let carries_stream = segment.seglen > 0 || segment.fin();
        if segment.syn() {
            fwd.anchor_stream(segment.seq);
        } else if carries_stream && fwd.stream_base().is_none() {
            // Without a SYN the peer's ACK says where the stream stands.
            match rev.last_ack() {
                _ if !holds_early => fwd.start_stream(segment.seq),
                Some(acked) => fwd.start_stream(earlier(acked, segment.seq)),
                None => {}
            }
        }
        let mut disposition = if fwd.stream_base().is_some() {
            forward.feed(fwd, &StreamBytes::of(segment), segment.frame, &mut sink)
        } else if carries_stream {
            fwd.hold_early(EarlySegment {
                frame: segment.frame,
                seq: segment.seq,
                seglen: segment.seglen,
                payload: segment.payload.clone(),
                fin: segment.fin(),
            });
            if fwd.early().len() > cap {
                tracing::warn!(
                    stream = resolved.stream,
                    cap,
                    "too much data before the stream start, starting at the earliest byte held"
                );
                forward.release(fwd, None, Some(segment.frame), &mut sink);
            }
            Disposition::OutOfOrder
        } else {
            Disposition::NoPayload
        };
        if fwd.stream_base().is_some() && !fwd.early().is_empty() {
            forward.release(fwd, None, Some(segment.frame), &mut sink);
        }
        if let Some(ack) = segment.ack_number() {
            if !rev.early().is_empty() {
                backward.release(rev, Some(ack), Some(segment.frame), &mut sink);
            }
        }
        if !delivered.is_empty()
            && matches!(
                disposition,
                Disposition::NoPayload | Disposition::Buffered | Disposition::OutOfOrder
            )
        {
            disposition = Disposition::Delivered;
        }

        let relative = self.analysis.relative_sequence_numbers;
        let shown = |dir: &Direction, value: u32| {
            if relative {
                dir.relative(value)
            } else {
                value
            }
        };
        let window_size = if segment.syn() {
            segment.window as u32
        } else {
            fwd.scaled_window(segment.window, self.analysis.default_window_scale)
        };
        let timestamps = self.analysis.calculate_timestamps;
        let report = SegmentReport {
            frame: segment.frame,
            stream: resolved.stream,
            direction,
            seq: shown(&*fwd, segment.seq),
            ack: segment.ack_number().map(|ack| shown(&*rev, ack)),
            next_seq: shown(&*fwd, segment.next_seq()),
            seglen: segment.seglen,
            window_size,
            time_relative: timestamps.then_some(time_relative),
            time_delta: timestamps.then_some(time_delta),
            annotation,
            disposition,
        };

        flow.push_follow(follow);
        flow.stats_mut().record(&report.annotation);
        tracing::trace!(
            frame = segment.frame,
            stream = resolved.stream,
            %direction,
            ?disposition,
            pdus = delivered.len(),
            "segment processed"
        );
        if let Some(range) = self.append_log(delivered) {
            self.occurrences.insert(key, range);
        }
        self.reports.insert(key, report.clone());
        Ok(report)
    }

    fn replay(
        &self,
        key: OccurrenceKey,
        consumer: &mut dyn PduConsumer,
    ) -> Result<SegmentReport, SegmentError> {
        let report = self
            .reports
            .get(&key)
            .ok_or(SegmentError::NotAnalyzed { frame: key.0 })?;
        for recorded in self.deliveries(key.0, key.1, key.2) {
            consumer.consume(&recorded.as_pdu());
        }
        Ok(report.clone())
    }

    fn append_log(&mut self, delivered: Vec<RecordedPdu>) -> Option<Range<usize>> {
        if delivered.is_empty() {
            return None;
        }
        let start = self.log.len();
        self.log.extend(delivered);
        Some(start..self.log.len())
    }

    /// End of input: give up on every gap so held bytes reach the consumer
    /// and the follow export. Returns the deliveries this produced.
    pub fn flush(&mut self, consumer: &mut dyn PduConsumer) -> Vec<RecordedPdu> {
        let mut delivered = Vec::new();
        let cap = self.reassembler.config().max_out_of_order_segments;
        for flow in self.directory.iter_mut() {
            let stream = flow.stream();
            for direction in [FlowDirection::AtoB, FlowDirection::BtoA] {
                let feeder = Feeder {
                    reassembler: &self.reassembler,
                    stream,
                    direction,
                    follow_cap: cap,
                };
                let mut follow = Vec::new();
                let (fwd, _, _) = flow.split(direction);
                let mut sink = Sink {
                    consumer: &mut *consumer,
                    delivered: &mut delivered,
                    follow: &mut follow,
                };
                feeder.release(fwd, None, None, &mut sink);
                self.reassembler.flush(
                    &mut fwd.reassembly,
                    stream,
                    direction,
                    &mut *consumer,
                    &mut delivered,
                );
                follow.extend(fwd.follow.flush(direction));
                flow.push_follow(follow);
            }
        }
        if !delivered.is_empty() {
            tracing::debug!(pdus = delivered.len(), "flushed held segments");
        }
        if let Some(range) = self.append_log(delivered.clone()) {
            self.flushed.push(range);
        }
        delivered
    }

    /// Replay what [`Analyzer::flush`] delivered; a later pass calls this
    /// after its last segment.
    pub fn replay_flush(&self, consumer: &mut dyn PduConsumer) {
        for recorded in self.flushed_deliveries() {
            consumer.consume(&recorded.as_pdu());
        }
    }

    pub fn report(&self, frame: FrameId, seq: u32, ack: u32) -> Option<&SegmentReport> {
        self.reports.get(&(frame, seq, ack))
    }

    /// Consumer invocations recorded while processing one segment occurrence.
    pub fn deliveries(&self, frame: FrameId, seq: u32, ack: u32) -> &[RecordedPdu] {
        self.occurrences
            .get(&(frame, seq, ack))
            .and_then(|range| self.log.get(range.clone()))
            .unwrap_or(&[])
    }

    pub fn flushed_deliveries(&self) -> impl Iterator<Item = &RecordedPdu> {
        self.flushed
            .iter()
            .flat_map(|range| self.log.get(range.clone()).unwrap_or(&[]))
    }

    /// Every delivery in first-pass order.
    pub fn all_deliveries(&self) -> impl Iterator<Item = &RecordedPdu> {
        self.log.iter()
    }

    pub fn flow(&self, stream: StreamId) -> Option<&Flow> {
        self.directory.get(stream)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.directory.iter()
    }

    pub fn follow_stream(&self, stream: StreamId) -> Option<&[FollowRecord]> {
        self.directory.get(stream).map(Flow::follow_records)
    }

    /// Unacknowledged bytes currently outstanding in one direction.
    pub fn bytes_in_flight(&self, stream: StreamId, direction: FlowDirection) -> Option<u32> {
        let flow = self.directory.get(stream)?;
        let peer = flow.direction(direction.reverse());
        Some(flow.direction(direction).bytes_in_flight(&peer.sack))
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.directory.snapshot()
    }
}

/// The earlier of two sequence numbers.
fn earlier(a: u32, b: u32) -> u32 {
    if seq::lt(a, b) {
        a
    } else {
        b
    }
}

/// Where deliveries and follow records of one call end up.
struct Sink<'a> {
    consumer: &'a mut dyn PduConsumer,
    delivered: &'a mut Vec<RecordedPdu>,
    follow: &'a mut Vec<FollowRecord>,
}

/// Stream bytes of one segment, live or held back.
struct StreamBytes<'a> {
    frame: FrameId,
    seq: u32,
    seglen: u32,
    payload: &'a [u8],
    syn: bool,
    fin: bool,
}

impl<'a> StreamBytes<'a> {
    fn of(segment: &'a Segment) -> Self {
        StreamBytes {
            frame: segment.frame,
            seq: segment.seq,
            seglen: segment.seglen,
            payload: &segment.payload,
            syn: segment.syn(),
            fin: segment.fin(),
        }
    }

    fn held(early: &'a EarlySegment) -> Self {
        StreamBytes {
            frame: early.frame,
            seq: early.seq,
            seglen: early.seglen,
            payload: &early.payload,
            syn: false,
            fin: early.fin,
        }
    }
}

/// Runs one direction's stream bytes through reassembly and the follow
/// export.
#[derive(Clone, Copy)]
struct Feeder<'a> {
    reassembler: &'a Reassembler,
    stream: StreamId,
    direction: FlowDirection,
    follow_cap: usize,
}

impl Feeder<'_> {
    fn feed(
        &self,
        dir: &mut Direction,
        bytes: &StreamBytes<'_>,
        at: FrameId,
        sink: &mut Sink<'_>,
    ) -> Disposition {
        let Some(offset) = dir.stream_offset(bytes.seq) else {
            return Disposition::NoPayload;
        };
        let data_seq = offset.wrapping_add(bytes.syn as u32);
        let input = SegmentInput {
            stream: self.stream,
            direction: self.direction,
            frame: bytes.frame,
            seq: data_seq,
            seglen: bytes.seglen,
            payload: bytes.payload,
            syn: bytes.syn,
            fin: bytes.fin,
        };
        let disposition = self.reassembler.process_at(
            &mut dir.reassembly,
            &input,
            at,
            &mut *sink.consumer,
            sink.delivered,
        );
        if bytes.syn {
            dir.follow.start_at(data_seq);
        }
        sink.follow.extend(dir.follow.push(
            self.direction,
            bytes.frame,
            data_seq,
            bytes.payload,
            self.follow_cap,
        ));
        disposition
    }

    /// Feed everything held for `dir` in sequence order. Without a known
    /// start the stream begins at the peer's `ack` when that lies before
    /// the held bytes, else at the earliest held byte. `at` is the frame
    /// being processed; `None` attributes each delivery to its own frame.
    fn release(
        &self,
        dir: &mut Direction,
        ack: Option<u32>,
        at: Option<FrameId>,
        sink: &mut Sink<'_>,
    ) {
        let held = dir.take_early();
        let Some(first) = held.first() else {
            return;
        };
        let start = ack.map_or(first.seq, |ack| earlier(ack, first.seq));
        dir.start_stream(start);
        tracing::debug!(
            stream = self.stream,
            direction = %self.direction,
            held = held.len(),
            start,
            "releasing segments held before the stream start"
        );
        for early in &held {
            self.feed(dir, &StreamBytes::held(early), at.unwrap_or(early.frame), sink);
        }
    }
}
