//! Raw stream export: each direction's bytes in sequence order, independent
//! of what any PDU consumer asked for.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::flow::FlowDirection;
use crate::segment::FrameId;
use crate::seq;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowRecord {
    pub direction: FlowDirection,
    pub frame: FrameId,
    /// Relative byte range `[start, end)`.
    pub start: u32,
    pub end: u32,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct FollowTracker {
    next: Option<u32>,
    pending: BTreeMap<u32, (FrameId, Vec<u8>)>,
}

impl FollowTracker {
    pub fn new() -> Self {
        FollowTracker::default()
    }

    /// Relative sequence number of the next byte expected.
    pub fn next(&self) -> Option<u32> {
        self.next
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// The stream starts here (first byte after a SYN).
    pub(crate) fn start_at(&mut self, seq_start: u32) {
        if self.next.is_none() {
            self.next = Some(seq_start);
        }
    }

    /// Offer captured bytes; returns whatever became contiguous.
    pub(crate) fn push(
        &mut self,
        direction: FlowDirection,
        frame: FrameId,
        seq_start: u32,
        data: &[u8],
        cap: usize,
    ) -> Vec<FollowRecord> {
        let mut records = Vec::new();
        if data.is_empty() {
            return records;
        }
        let next = *self.next.get_or_insert(seq_start);
        let end = seq_start.wrapping_add(data.len() as u32);
        if seq::le(end, next) {
            return records;
        }
        if seq::gt(seq_start, next) {
            let keep = self
                .pending
                .get(&seq_start)
                .map_or(true, |(_, held)| held.len() < data.len());
            if keep {
                self.pending.insert(seq_start, (frame, data.to_vec()));
            }
            if self.pending.len() > cap {
                if let Some(&first) = self.pending.keys().next() {
                    self.next = Some(first);
                }
                self.drain(direction, &mut records);
            }
            return records;
        }
        self.emit(direction, frame, seq_start, data, &mut records);
        self.drain(direction, &mut records);
        records
    }

    /// Emit everything still held, skipping over the gaps.
    pub(crate) fn flush(&mut self, direction: FlowDirection) -> Vec<FollowRecord> {
        let mut records = Vec::new();
        while let Some(&first) = self.pending.keys().next() {
            if self.next.map_or(true, |next| seq::gt(first, next)) {
                self.next = Some(first);
            }
            self.drain(direction, &mut records);
        }
        records
    }

    fn drain(&mut self, direction: FlowDirection, records: &mut Vec<FollowRecord>) {
        while let Some(next) = self.next {
            let Some((&seq_start, _)) = self.pending.range(..=next).next() else {
                break;
            };
            let Some((frame, data)) = self.pending.remove(&seq_start) else {
                break;
            };
            self.emit(direction, frame, seq_start, &data, records);
        }
    }

    fn emit(
        &mut self,
        direction: FlowDirection,
        frame: FrameId,
        seq_start: u32,
        data: &[u8],
        records: &mut Vec<FollowRecord>,
    ) {
        let next = self.next.unwrap_or(seq_start);
        let end = seq_start.wrapping_add(data.len() as u32);
        if seq::le(end, next) {
            return;
        }
        let skip = if seq::lt(seq_start, next) {
            next.wrapping_sub(seq_start) as usize
        } else {
            0
        };
        let start = seq_start.wrapping_add(skip as u32);
        records.push(FollowRecord {
            direction,
            frame,
            start,
            end,
            data: data[skip..].to_vec(),
        });
        self.next = Some(end);
    }
}
