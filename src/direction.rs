//! Per-half-connection state: everything the sequence analysis and the
//! reassembly engine remember about one direction of a flow.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::analysis::AnalysisFlags;
use crate::follow::FollowTracker;
use crate::reassembly::ReassemblyState;
use crate::segment::{FrameId, SackBlock};
use crate::seq;

/// Largest shift RFC 7323 allows.
pub const MAX_WINDOW_SHIFT: u8 = 14;

/// Window scaling in effect for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum WindowScale {
    /// No SYN seen, so the shift cannot be known.
    Unknown,
    /// Handshake seen without scaling negotiated.
    NoScaling,
    Shift(u8),
}

impl WindowScale {
    /// From the option carried by a SYN; the shift is clamped to 14.
    pub fn from_option(option: Option<u8>) -> Self {
        match option {
            Some(shift) => WindowScale::Shift(shift.min(MAX_WINDOW_SHIFT)),
            None => WindowScale::NoScaling,
        }
    }

    /// Effective shift, `None` while unknown.
    pub fn shift(self) -> Option<u8> {
        match self {
            WindowScale::Unknown => None,
            WindowScale::NoScaling => Some(0),
            WindowScale::Shift(shift) => Some(shift),
        }
    }

    /// Falls back to `default` while this one is unknown.
    pub fn or(self, default: WindowScale) -> WindowScale {
        match self {
            WindowScale::Unknown => default,
            known => known,
        }
    }
}

impl TryFrom<i8> for WindowScale {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(WindowScale::Unknown),
            -2 => Ok(WindowScale::NoScaling),
            0..=14 => Ok(WindowScale::Shift(value as u8)),
            other => Err(format!(
                "window scale must be -1 (unknown), -2 (none) or 0..=14, got {}",
                other
            )),
        }
    }
}

impl From<WindowScale> for i8 {
    fn from(scale: WindowScale) -> Self {
        match scale {
            WindowScale::Unknown => -1,
            WindowScale::NoScaling => -2,
            WindowScale::Shift(shift) => shift as i8,
        }
    }
}

impl fmt::Display for WindowScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowScale::Unknown => write!(f, "unknown"),
            WindowScale::NoScaling => write!(f, "no scaling"),
            WindowScale::Shift(shift) => write!(f, "x{}", 1u32 << shift),
        }
    }
}

/// A segment that consumed sequence space and has not been acknowledged yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnackedSegment {
    pub frame: FrameId,
    pub seq: u32,
    pub next_seq: u32,
    pub ts: f64,
}

/// Stream bytes that arrived before the direction's first byte was known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlySegment {
    pub frame: FrameId,
    /// Absolute sequence number.
    pub seq: u32,
    pub seglen: u32,
    pub payload: Vec<u8>,
    pub fin: bool,
}

#[derive(Debug)]
pub struct Direction {
    base_seq: Option<u32>,
    base_from_syn: bool,
    /// Absolute sequence number reassembly offsets are counted from.
    stream_base: Option<u32>,
    /// Sorted by sequence number.
    early: Vec<EarlySegment>,
    pub(crate) window_scale: WindowScale,

    pub(crate) next_seq: Option<u32>,
    pub(crate) next_seq_frame: FrameId,
    pub(crate) next_seq_time: f64,
    pub(crate) max_seq_to_be_acked: Option<u32>,
    pub(crate) last_ack: Option<u32>,
    pub(crate) last_ack_time: f64,
    pub(crate) window: Option<u16>,
    /// Newest first.
    pub(crate) unacked: VecDeque<UnackedSegment>,
    pub(crate) dupack_count: u32,
    pub(crate) last_nondup_ack_frame: FrameId,
    pub(crate) last_segment_flags: AnalysisFlags,
    pub(crate) bif_valid: bool,
    pub(crate) push_bytes: u32,
    /// SACK blocks most recently reported by this side about its peer's data.
    pub(crate) sack: Vec<SackBlock>,
    pub(crate) fin_seen: bool,

    pub(crate) reassembly: ReassemblyState,
    pub(crate) follow: FollowTracker,
}

impl Direction {
    pub(crate) fn new() -> Self {
        Direction {
            base_seq: None,
            base_from_syn: false,
            stream_base: None,
            early: Vec::new(),
            window_scale: WindowScale::Unknown,
            next_seq: None,
            next_seq_frame: 0,
            next_seq_time: 0.0,
            max_seq_to_be_acked: None,
            last_ack: None,
            last_ack_time: 0.0,
            window: None,
            unacked: VecDeque::new(),
            dupack_count: 0,
            last_nondup_ack_frame: 0,
            last_segment_flags: AnalysisFlags::empty(),
            bif_valid: true,
            push_bytes: 0,
            sack: Vec::new(),
            fin_seen: false,
            reassembly: ReassemblyState::new(),
            follow: FollowTracker::new(),
        }
    }

    /// Latch the base sequence. Only the first call has any effect.
    pub(crate) fn latch_base(&mut self, base: u32, from_syn: bool) -> bool {
        if self.base_seq.is_some() {
            return false;
        }
        self.base_seq = Some(base);
        self.base_from_syn = from_syn;
        true
    }

    pub fn base_seq(&self) -> Option<u32> {
        self.base_seq
    }

    /// The base came from an observed SYN rather than being inferred.
    pub fn base_from_syn(&self) -> bool {
        self.base_from_syn
    }

    /// Offset of `seq` from the base; identity while no base is latched.
    pub fn relative(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.base_seq.unwrap_or(0))
    }

    pub fn stream_base(&self) -> Option<u32> {
        self.stream_base
    }

    /// Position of `seq` in the reassembly space, `None` until the stream
    /// start is known.
    pub fn stream_offset(&self, seq: u32) -> Option<u32> {
        self.stream_base.map(|base| seq.wrapping_sub(base))
    }

    /// Anchor the reassembly space at a SYN. Only the first anchor counts.
    pub(crate) fn anchor_stream(&mut self, base: u32) {
        if self.stream_base.is_none() {
            self.stream_base = Some(base);
        }
    }

    /// The stream is taken to begin at `start` (offset 1) without a SYN.
    pub(crate) fn start_stream(&mut self, start: u32) {
        if self.stream_base.is_some() {
            return;
        }
        self.stream_base = Some(start.wrapping_sub(1));
        self.reassembly.start_at(1);
        self.follow.start_at(1);
    }

    pub fn early(&self) -> &[EarlySegment] {
        &self.early
    }

    /// Keep a segment until the stream start is known. At one sequence
    /// number the longer segment wins.
    pub(crate) fn hold_early(&mut self, segment: EarlySegment) {
        match self.early.iter().position(|held| !seq::lt(held.seq, segment.seq)) {
            Some(i) if self.early[i].seq == segment.seq => {
                if self.early[i].seglen < segment.seglen {
                    self.early[i] = segment;
                }
            }
            Some(i) => self.early.insert(i, segment),
            None => self.early.push(segment),
        }
    }

    pub(crate) fn take_early(&mut self) -> Vec<EarlySegment> {
        std::mem::take(&mut self.early)
    }

    pub fn next_seq(&self) -> Option<u32> {
        self.next_seq
    }

    pub fn max_seq_to_be_acked(&self) -> Option<u32> {
        self.max_seq_to_be_acked
    }

    pub fn last_ack(&self) -> Option<u32> {
        self.last_ack
    }

    pub fn window(&self) -> Option<u16> {
        self.window
    }

    pub fn window_scale(&self) -> WindowScale {
        self.window_scale
    }

    pub fn dupack_count(&self) -> u32 {
        self.dupack_count
    }

    pub fn unacked(&self) -> impl Iterator<Item = &UnackedSegment> {
        self.unacked.iter()
    }

    pub fn reassembly(&self) -> &ReassemblyState {
        &self.reassembly
    }

    /// Apply this direction's shift (or `default` while unknown) to a raw
    /// advertised window.
    pub fn scaled_window(&self, raw: u16, default: WindowScale) -> u32 {
        let shift = self.window_scale.or(default).shift().unwrap_or(0);
        (raw as u32) << shift
    }

    /// Remember a segment until it is acknowledged. The oldest entry is
    /// dropped once `cap` is reached.
    pub(crate) fn push_unacked(&mut self, segment: UnackedSegment, cap: usize) {
        if cap == 0 {
            return;
        }
        while self.unacked.len() >= cap {
            if let Some(dropped) = self.unacked.pop_back() {
                tracing::debug!(
                    frame = dropped.frame,
                    cap,
                    "unacked segment list full, dropping oldest entry"
                );
            }
        }
        self.unacked.push_front(segment);
    }

    /// Drop every segment fully covered by `ack`. Returns the newest one
    /// removed, which is the segment this ACK most plausibly answers.
    pub(crate) fn prune_acked(&mut self, ack: u32) -> Option<UnackedSegment> {
        let mut newest = None;
        self.unacked.retain(|segment| {
            if seq::le(segment.next_seq, ack) {
                if newest.is_none() {
                    newest = Some(*segment);
                }
                false
            } else {
                true
            }
        });
        newest
    }

    /// Span of unacknowledged sequence space minus the ranges the peer has
    /// reported via SACK.
    pub fn bytes_in_flight(&self, peer_sack: &[SackBlock]) -> u32 {
        let mut iter = self.unacked.iter();
        let Some(first) = iter.next() else {
            return 0;
        };
        let (mut lo, mut hi) = (first.seq, first.next_seq);
        for segment in iter {
            if seq::lt(segment.seq, lo) {
                lo = segment.seq;
            }
            if seq::gt(segment.next_seq, hi) {
                hi = segment.next_seq;
            }
        }
        let span = hi.wrapping_sub(lo);
        span.saturating_sub(sacked_within(peer_sack, lo, hi))
    }
}

/// Bytes of `[lo, hi)` covered by the union of `blocks`.
fn sacked_within(blocks: &[SackBlock], lo: u32, hi: u32) -> u32 {
    let mut ranges: Vec<(u32, u32)> = blocks
        .iter()
        .filter_map(|block| {
            let left = seq::max(block.left, lo);
            let right = if seq::lt(block.right, hi) { block.right } else { hi };
            if seq::lt(left, right) {
                Some((left.wrapping_sub(lo), right.wrapping_sub(lo)))
            } else {
                None
            }
        })
        .collect();
    ranges.sort_unstable();

    let mut covered = 0u32;
    let mut reach = 0u32;
    for (start, end) in ranges {
        let start = start.max(reach);
        if end > start {
            covered += end - start;
            reach = end;
        }
    }
    covered
}
