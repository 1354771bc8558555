//! Segment reassembly: turns each direction's payload into the byte ranges a
//! PDU consumer asks for, across segment boundaries, gaps and splits.
//!
//! All sequence numbers here are relative to the direction's base, so the
//! ordered maps below sort correctly for the first 4 GiB of a direction.

pub mod msp;
pub mod ooo;

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ReassemblyConfig;
use crate::flow::{FlowDirection, StreamId};
use crate::segment::FrameId;
use crate::seq;

pub use msp::{Fragment, Msp, MspFlags};
pub use ooo::{OooEntry, OutOfOrderBuffer};

/// Span requested for "everything until the connection closes".
pub const UNTIL_CLOSE_SPAN: u32 = 0x4000_0000;

/// What a PDU consumer did with the bytes it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "snake_case")]
pub enum ConsumeResult {
    Consumed,
    /// A new message starts this many bytes in.
    ConsumedPrefix(usize),
    /// The message continues this many bytes past the end of the buffer.
    NeedMore(usize),
    NeedUntilClose,
    /// Length unknown: hand over the next segment as a whole.
    NeedMoreSegment,
}

/// One contiguous byte range handed to the consumer.
#[derive(Debug, Clone, Copy)]
pub struct Pdu<'a> {
    pub stream: StreamId,
    pub direction: FlowDirection,
    /// Relative sequence number of `data[0]`.
    pub seq: u32,
    /// Frame being processed when the bytes were delivered.
    pub frame: FrameId,
    /// Frame the bytes are attributed to.
    pub first_frame: FrameId,
    pub data: &'a [u8],
    pub reassembled: bool,
}

/// Receives reassembled byte ranges, e.g. an application protocol parser.
pub trait PduConsumer {
    fn consume(&mut self, pdu: &Pdu<'_>) -> ConsumeResult;
}

impl<F> PduConsumer for F
where
    F: FnMut(&Pdu<'_>) -> ConsumeResult,
{
    fn consume(&mut self, pdu: &Pdu<'_>) -> ConsumeResult {
        self(pdu)
    }
}

/// A consumer that takes everything it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumeAll;

impl PduConsumer for ConsumeAll {
    fn consume(&mut self, _pdu: &Pdu<'_>) -> ConsumeResult {
        ConsumeResult::Consumed
    }
}

/// A delivery as it happened on the first pass, kept for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedPdu {
    pub stream: StreamId,
    pub direction: FlowDirection,
    pub frame: FrameId,
    pub first_frame: FrameId,
    pub seq: u32,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub reassembled: bool,
    pub result: ConsumeResult,
}

impl RecordedPdu {
    pub fn as_pdu(&self) -> Pdu<'_> {
        Pdu {
            stream: self.stream,
            direction: self.direction,
            seq: self.seq,
            frame: self.frame,
            first_frame: self.first_frame,
            data: &self.data,
            reassembled: self.reassembled,
        }
    }
}

/// What reassembly did with one segment's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    NoPayload,
    /// Every byte was already placed by an earlier segment.
    Repeated,
    /// Held until the gap before it is filled.
    OutOfOrder,
    /// Captured payload shorter than the segment; its range was skipped.
    Truncated,
    /// Added to a message that still needs more bytes.
    Buffered,
    /// At least one range went to the consumer.
    Delivered,
    /// Reassembly disabled; payload handed over as is.
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FinMark {
    pub frame: FrameId,
    /// Relative sequence number the FIN occupies.
    pub seq: u32,
}

/// Reassembly state of one direction.
#[derive(Debug, Default)]
pub struct ReassemblyState {
    frontier: Option<u32>,
    msps: BTreeMap<u32, Msp>,
    ooo: OutOfOrderBuffer,
    until_fin: bool,
    fin: Option<FinMark>,
    fin_delivered: bool,
}

impl ReassemblyState {
    pub fn new() -> Self {
        ReassemblyState::default()
    }

    /// End of the contiguous bytes seen so far.
    pub fn frontier(&self) -> Option<u32> {
        self.frontier
    }

    pub fn msps(&self) -> impl Iterator<Item = &Msp> {
        self.msps.values()
    }

    /// The MSP starting at or most recently before `seq`.
    pub fn msp_at(&self, seq: u32) -> Option<&Msp> {
        self.msps.range(..=seq).next_back().map(|(_, msp)| msp)
    }

    /// The MSP still collecting bytes, if any.
    pub fn pending_msp(&self) -> Option<&Msp> {
        self.pending_key().and_then(|key| self.msps.get(&key))
    }

    pub fn out_of_order(&self) -> &OutOfOrderBuffer {
        &self.ooo
    }

    pub fn until_fin(&self) -> bool {
        self.until_fin
    }

    /// The FIN that terminates the direction's stream.
    pub fn fin(&self) -> Option<FinMark> {
        self.fin
    }

    /// The stream's first byte is known to be at `seq`.
    pub(crate) fn start_at(&mut self, seq_start: u32) {
        if self.frontier.is_none() {
            self.frontier = Some(seq_start);
        }
    }

    fn pending_key(&self) -> Option<u32> {
        self.msps
            .iter()
            .next_back()
            .filter(|(_, msp)| !msp.is_done())
            .map(|(key, _)| *key)
    }
}

/// Payload of one segment, positioned in its direction's relative space.
#[derive(Debug, Clone, Copy)]
pub struct SegmentInput<'a> {
    pub stream: StreamId,
    pub direction: FlowDirection,
    pub frame: FrameId,
    /// Relative sequence number of the first payload byte.
    pub seq: u32,
    pub seglen: u32,
    pub payload: &'a [u8],
    pub syn: bool,
    pub fin: bool,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    config: ReassemblyConfig,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Reassembler { config }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn process(
        &self,
        state: &mut ReassemblyState,
        input: &SegmentInput<'_>,
        consumer: &mut dyn PduConsumer,
        out: &mut Vec<RecordedPdu>,
    ) -> Disposition {
        self.process_at(state, input, input.frame, consumer, out)
    }

    /// Like [`Reassembler::process`] for a segment held back earlier and
    /// released while frame `at` is being processed.
    pub fn process_at(
        &self,
        state: &mut ReassemblyState,
        input: &SegmentInput<'_>,
        at: FrameId,
        consumer: &mut dyn PduConsumer,
        out: &mut Vec<RecordedPdu>,
    ) -> Disposition {
        let mut session = Session {
            config: &self.config,
            state,
            consumer,
            out,
            stream: input.stream,
            direction: input.direction,
            frame: at,
        };
        session.segment(input)
    }

    /// Give up on every remaining gap so buffered bytes reach the consumer.
    pub fn flush(
        &self,
        state: &mut ReassemblyState,
        stream: StreamId,
        direction: FlowDirection,
        consumer: &mut dyn PduConsumer,
        out: &mut Vec<RecordedPdu>,
    ) {
        while let Some((seq, frame)) = state.ooo.first().map(|(seq, entry)| (seq, entry.frame)) {
            let mut session = Session {
                config: &self.config,
                state: &mut *state,
                consumer: &mut *consumer,
                out: &mut *out,
                stream,
                direction,
                frame,
            };
            session.abandon_gap(seq);
            session.drain_out_of_order();
        }
    }
}

struct Session<'s> {
    config: &'s ReassemblyConfig,
    state: &'s mut ReassemblyState,
    consumer: &'s mut dyn PduConsumer,
    out: &'s mut Vec<RecordedPdu>,
    stream: StreamId,
    direction: FlowDirection,
    frame: FrameId,
}

impl Session<'_> {
    fn segment(&mut self, input: &SegmentInput<'_>) -> Disposition {
        if input.syn {
            self.state.start_at(input.seq);
        }
        if input.fin && self.state.fin.is_none() {
            self.state.fin = Some(FinMark {
                frame: input.frame,
                seq: input.seq.wrapping_add(input.seglen),
            });
        }

        let delivered_before = self.out.len();
        let disposition = if input.seglen == 0 {
            Disposition::NoPayload
        } else if !self.config.enabled {
            self.passthrough(input);
            Disposition::Passthrough
        } else if (input.payload.len() as u64) < input.seglen as u64 {
            self.truncated(input);
            Disposition::Truncated
        } else {
            self.data(input.seq, input.frame, input.payload)
        };

        self.finish_at_fin();

        let delivered = self.out.len() > delivered_before;
        match disposition {
            Disposition::NoPayload | Disposition::Buffered | Disposition::OutOfOrder if delivered => {
                Disposition::Delivered
            }
            other => other,
        }
    }

    fn passthrough(&mut self, input: &SegmentInput<'_>) {
        let result = self.consumer.consume(&Pdu {
            stream: self.stream,
            direction: self.direction,
            seq: input.seq,
            frame: self.frame,
            first_frame: input.frame,
            data: input.payload,
            reassembled: false,
        });
        self.out.push(RecordedPdu {
            stream: self.stream,
            direction: self.direction,
            frame: self.frame,
            first_frame: input.frame,
            seq: input.seq,
            data: input.payload.to_vec(),
            reassembled: false,
            result,
        });
    }

    fn truncated(&mut self, input: &SegmentInput<'_>) {
        let end = input.seq.wrapping_add(input.seglen);
        tracing::debug!(
            stream = self.stream,
            frame = self.frame,
            captured = input.payload.len(),
            seglen = input.seglen,
            "truncated payload, skipping its sequence range"
        );
        match self.state.frontier {
            None => self.state.frontier = Some(end),
            Some(frontier) if seq::gt(end, frontier) => self.abandon_gap(end),
            Some(_) => {}
        }
        self.drain_out_of_order();
    }

    fn data(&mut self, seq_start: u32, src_frame: FrameId, payload: &[u8]) -> Disposition {
        let frontier = *self.state.frontier.get_or_insert(seq_start);
        let end = seq_start.wrapping_add(payload.len() as u32);
        if seq::le(end, frontier) {
            return Disposition::Repeated;
        }

        if seq::gt(seq_start, frontier) {
            if self.config.out_of_order {
                tracing::trace!(
                    stream = self.stream,
                    frame = self.frame,
                    seq = seq_start,
                    frontier,
                    "buffering out-of-order segment"
                );
                self.state.ooo.insert(seq_start, src_frame, payload.to_vec());
                if self.state.ooo.len() > self.config.max_out_of_order_segments {
                    tracing::warn!(
                        stream = self.stream,
                        cap = self.config.max_out_of_order_segments,
                        "out-of-order buffer full, giving up on the earliest gap"
                    );
                    if let Some((first, _)) = self.state.ooo.first() {
                        self.abandon_gap(first);
                    }
                    self.drain_out_of_order();
                } else {
                    self.ensure_placeholder();
                }
                return Disposition::OutOfOrder;
            }
            self.abandon_gap(seq_start);
        }

        let frontier = self.state.frontier.unwrap_or(seq_start);
        let skip = if seq::lt(seq_start, frontier) {
            frontier.wrapping_sub(seq_start) as usize
        } else {
            0
        };
        let delivered_before = self.out.len();
        self.advance(seq_start.wrapping_add(skip as u32), src_frame, &payload[skip..]);
        self.drain_out_of_order();
        if self.out.len() > delivered_before {
            Disposition::Delivered
        } else {
            Disposition::Buffered
        }
    }

    /// Place bytes starting exactly at the frontier.
    fn advance(&mut self, seq_start: u32, src_frame: FrameId, data: &[u8]) {
        let end = seq_start.wrapping_add(data.len() as u32);
        let frontier = self.state.frontier.map_or(end, |f| seq::max(f, end));
        self.state.frontier = Some(frontier);

        let mut seq_at = seq_start;
        let mut rest = data;
        while !rest.is_empty() {
            let Some(key) = self.state.pending_key() else {
                self.consume_loop(seq_at, rest.to_vec(), src_frame, None, false);
                return;
            };
            let Some(msp) = self.state.msps.get_mut(&key) else {
                return;
            };

            if msp.is_placeholder() {
                msp.append(seq_at, src_frame, rest.to_vec());
                rest = &[];
                self.absorb_ready(key);
                self.complete_and_deliver(key);
            } else if msp.flags.contains(MspFlags::REASSEMBLE_ENTIRE_SEGMENT) {
                msp.append(seq_at, src_frame, rest.to_vec());
                rest = &[];
                self.complete_and_deliver(key);
            } else {
                let wanted = msp.nxtpdu.wrapping_sub(seq_at);
                let take = if seq::gt(msp.nxtpdu, seq_at) {
                    (wanted as usize).min(rest.len())
                } else {
                    0
                };
                msp.append(seq_at, src_frame, rest[..take].to_vec());
                seq_at = seq_at.wrapping_add(take as u32);
                rest = &rest[take..];
                if seq::ge(msp.held_end(), msp.nxtpdu) {
                    self.complete_and_deliver(key);
                } else {
                    tracing::trace!(
                        stream = self.stream,
                        frame = self.frame,
                        msp = key,
                        nxtpdu = msp.nxtpdu,
                        "msp waiting for more bytes"
                    );
                    return;
                }
            }
        }
    }

    /// Pull every buffered entry that now touches the frontier into `key`.
    fn absorb_ready(&mut self, key: u32) {
        while let Some(frontier) = self.state.frontier {
            let Some((seq_start, entry)) = self.state.ooo.pop_ready(frontier) else {
                break;
            };
            let end = entry.end(seq_start);
            if seq::le(end, frontier) {
                continue;
            }
            let skip = frontier.wrapping_sub(seq_start) as usize;
            if let Some(msp) = self.state.msps.get_mut(&key) {
                msp.append(frontier, entry.frame, entry.data[skip..].to_vec());
            }
            self.state.frontier = Some(end);
        }
    }

    fn complete_and_deliver(&mut self, key: u32) {
        let Some(msp) = self.state.msps.get_mut(&key) else {
            return;
        };
        msp.complete();
        let buffer = msp.assemble();
        let first_frame = msp.first_frame;
        let reassembled = msp.fragments().nth(1).is_some();
        tracing::debug!(
            stream = self.stream,
            frame = self.frame,
            msp = key,
            first_frame,
            len = buffer.len(),
            "msp complete"
        );
        self.consume_loop(key, buffer, first_frame, Some(key), reassembled);
    }

    fn consume_loop(
        &mut self,
        start: u32,
        buffer: Vec<u8>,
        first_frame: FrameId,
        msp_key: Option<u32>,
        reassembled: bool,
    ) {
        let mut offset = 0usize;
        let mut first_frame = first_frame;
        let mut msp_key = msp_key;
        let mut reassembled = reassembled;

        while offset < buffer.len() {
            let pdu_seq = start.wrapping_add(offset as u32);
            let slice = &buffer[offset..];
            let result = self.consumer.consume(&Pdu {
                stream: self.stream,
                direction: self.direction,
                seq: pdu_seq,
                frame: self.frame,
                first_frame,
                data: slice,
                reassembled,
            });
            self.out.push(RecordedPdu {
                stream: self.stream,
                direction: self.direction,
                frame: self.frame,
                first_frame,
                seq: pdu_seq,
                data: slice.to_vec(),
                reassembled,
                result,
            });

            let end = pdu_seq.wrapping_add(slice.len() as u32);
            match result {
                ConsumeResult::Consumed
                | ConsumeResult::ConsumedPrefix(0)
                | ConsumeResult::NeedMore(0) => return,
                ConsumeResult::ConsumedPrefix(n) if n >= slice.len() => return,
                ConsumeResult::ConsumedPrefix(n) => {
                    let at = pdu_seq.wrapping_add(n as u32);
                    if let Some(key) = msp_key {
                        if let Some(msp) = self.state.msps.get_mut(&key) {
                            let tail = msp.split_off(at);
                            first_frame = tail.first_frame;
                            reassembled = tail.fragments().nth(1).is_some();
                            tracing::trace!(stream = self.stream, msp = key, at, "msp split");
                            self.state.msps.insert(at, tail);
                            msp_key = Some(at);
                        }
                    }
                    offset += n;
                }
                ConsumeResult::NeedMore(more) => {
                    let more = u32::try_from(more)
                        .map_or(UNTIL_CLOSE_SPAN, |more| more.min(UNTIL_CLOSE_SPAN));
                    let nxtpdu = end.wrapping_add(more);
                    self.request(pdu_seq, slice, first_frame, msp_key, nxtpdu, MspFlags::empty());
                    return;
                }
                ConsumeResult::NeedUntilClose => {
                    self.state.until_fin = true;
                    let nxtpdu = pdu_seq.wrapping_add(UNTIL_CLOSE_SPAN);
                    self.request(pdu_seq, slice, first_frame, msp_key, nxtpdu, MspFlags::empty());
                    return;
                }
                ConsumeResult::NeedMoreSegment => {
                    self.request(
                        pdu_seq,
                        slice,
                        first_frame,
                        msp_key,
                        end,
                        MspFlags::REASSEMBLE_ENTIRE_SEGMENT,
                    );
                    return;
                }
            }
        }
    }

    /// Keep `data` (starting at `pdu_seq`) as the head of a message ending at
    /// `nxtpdu`.
    fn request(
        &mut self,
        pdu_seq: u32,
        data: &[u8],
        src_frame: FrameId,
        msp_key: Option<u32>,
        nxtpdu: u32,
        flags: MspFlags,
    ) {
        if let Some(msp) = msp_key.and_then(|key| self.state.msps.get_mut(&key)) {
            msp.reopen(nxtpdu, flags);
            return;
        }
        let mut msp = Msp::new(pdu_seq, nxtpdu, src_frame);
        msp.append(pdu_seq, src_frame, data.to_vec());
        msp.flags.insert(flags);
        tracing::debug!(
            stream = self.stream,
            frame = self.frame,
            seq = pdu_seq,
            nxtpdu,
            "msp created"
        );
        self.state.msps.insert(pdu_seq, msp);
    }

    /// Give up on the bytes between the frontier and `to`.
    fn abandon_gap(&mut self, to: u32) {
        if let Some(key) = self.state.pending_key() {
            if let Some(msp) = self.state.msps.get_mut(&key) {
                msp.sealed = true;
            }
            tracing::debug!(stream = self.stream, frame = self.frame, msp = key, "msp sealed");
        }
        let frontier = self.state.frontier.map_or(to, |f| seq::max(f, to));
        self.state.frontier = Some(frontier);
    }

    fn drain_out_of_order(&mut self) {
        while let Some(frontier) = self.state.frontier {
            let Some((seq_start, entry)) = self.state.ooo.pop_ready(frontier) else {
                break;
            };
            let end = entry.end(seq_start);
            if seq::le(end, frontier) {
                continue;
            }
            let skip = frontier.wrapping_sub(seq_start) as usize;
            self.advance(frontier, entry.frame, &entry.data[skip..]);
        }
        self.ensure_placeholder();
    }

    fn ensure_placeholder(&mut self) {
        if !self.config.out_of_order || self.state.pending_key().is_some() {
            return;
        }
        let (Some(frontier), Some((first, entry))) = (self.state.frontier, self.state.ooo.first())
        else {
            return;
        };
        let provisional_end = entry.end(first);
        let frame = entry.frame;
        if self.state.msps.contains_key(&frontier) {
            return;
        }
        self.state
            .msps
            .insert(frontier, Msp::placeholder(frontier, provisional_end, frame));
    }

    fn finish_at_fin(&mut self) {
        let state = &*self.state;
        if !state.until_fin || state.fin_delivered {
            return;
        }
        let (Some(fin), Some(frontier)) = (state.fin, state.frontier) else {
            return;
        };
        if seq::lt(frontier, fin.seq) {
            return;
        }
        let Some(key) = state.pending_key() else {
            return;
        };
        let Some(msp) = self.state.msps.get_mut(&key) else {
            return;
        };
        if msp.is_placeholder() {
            return;
        }
        if seq::gt(msp.held_end(), fin.seq) {
            msp.truncate(fin.seq);
        }
        self.state.fin_delivered = true;
        tracing::debug!(
            stream = self.stream,
            frame = self.frame,
            fin_frame = fin.frame,
            "stream closed, delivering until-close message"
        );
        self.complete_and_deliver(key);
    }
}
