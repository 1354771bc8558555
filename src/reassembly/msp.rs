//! Multi-segment PDUs: an application message whose bytes span several
//! segments, built up fragment by fragment in relative sequence space.

use bitflags::bitflags;
use std::collections::BTreeMap;

use crate::segment::FrameId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MspFlags: u8 {
        /// Length unknown; the next segment is taken whole.
        const REASSEMBLE_ENTIRE_SEGMENT = 0x01;
        /// Placeholder for bytes that arrived ahead of a gap.
        const MISSING_FIRST_SEGMENT = 0x02;
        const GOT_ALL_SEGMENTS = 0x04;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub frame: FrameId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Msp {
    pub seq: u32,
    /// Exclusive end; provisional for placeholders and open-ended requests.
    pub nxtpdu: u32,
    pub first_frame: FrameId,
    pub last_frame: FrameId,
    pub flags: MspFlags,
    /// Missing bytes were given up on; never completes.
    pub sealed: bool,
    fragments: BTreeMap<u32, Fragment>,
}

impl Msp {
    pub(crate) fn new(seq: u32, nxtpdu: u32, frame: FrameId) -> Self {
        Msp {
            seq,
            nxtpdu,
            first_frame: frame,
            last_frame: frame,
            flags: MspFlags::empty(),
            sealed: false,
            fragments: BTreeMap::new(),
        }
    }

    pub(crate) fn placeholder(seq: u32, provisional_end: u32, frame: FrameId) -> Self {
        let mut msp = Msp::new(seq, provisional_end, frame);
        msp.flags = MspFlags::MISSING_FIRST_SEGMENT;
        msp
    }

    pub fn is_done(&self) -> bool {
        self.sealed || self.flags.contains(MspFlags::GOT_ALL_SEGMENTS)
    }

    pub fn is_placeholder(&self) -> bool {
        self.flags.contains(MspFlags::MISSING_FIRST_SEGMENT)
    }

    pub fn fragments(&self) -> impl Iterator<Item = (u32, &Fragment)> {
        self.fragments.iter().map(|(seq, fragment)| (*seq, fragment))
    }

    /// First sequence number not yet held.
    pub fn held_end(&self) -> u32 {
        match self.fragments.iter().next_back() {
            Some((seq, fragment)) => seq.wrapping_add(fragment.data.len() as u32),
            None => self.seq,
        }
    }

    pub(crate) fn append(&mut self, seq: u32, frame: FrameId, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.fragments.is_empty() {
            self.first_frame = frame;
        }
        self.last_frame = frame;
        self.fragments.insert(seq, Fragment { frame, data });
    }

    /// All held bytes in sequence order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.held_end().wrapping_sub(self.seq) as usize);
        for fragment in self.fragments.values() {
            out.extend_from_slice(&fragment.data);
        }
        out
    }

    pub(crate) fn complete(&mut self) {
        self.nxtpdu = self.held_end();
        self.flags.remove(MspFlags::REASSEMBLE_ENTIRE_SEGMENT | MspFlags::MISSING_FIRST_SEGMENT);
        self.flags.insert(MspFlags::GOT_ALL_SEGMENTS);
    }

    /// Ask for more bytes after this one was delivered.
    pub(crate) fn reopen(&mut self, nxtpdu: u32, flags: MspFlags) {
        self.nxtpdu = nxtpdu;
        self.flags.remove(MspFlags::GOT_ALL_SEGMENTS);
        self.flags.insert(flags);
    }

    /// Drop everything at or past `end`.
    pub(crate) fn truncate(&mut self, end: u32) {
        let _ = self.split_fragments(end);
        self.nxtpdu = end;
    }

    /// Cut at `at`: this MSP keeps `[seq, at)` and the returned one holds the
    /// fragments (or fragment tails) from `at` on, each keeping its frame.
    pub(crate) fn split_off(&mut self, at: u32) -> Msp {
        let tail = self.split_fragments(at);
        let first_frame = tail
            .values()
            .next()
            .map_or(self.last_frame, |fragment| fragment.frame);
        let end = self.nxtpdu;
        let last_frame = self.last_frame;
        self.nxtpdu = at;
        self.last_frame = self
            .fragments
            .values()
            .next_back()
            .map_or(self.first_frame, |fragment| fragment.frame);
        Msp {
            seq: at,
            nxtpdu: end,
            first_frame,
            last_frame,
            flags: self.flags,
            sealed: false,
            fragments: tail,
        }
    }

    fn split_fragments(&mut self, at: u32) -> BTreeMap<u32, Fragment> {
        let mut tail = self.fragments.split_off(&at);
        if let Some((&start, fragment)) = self.fragments.range_mut(..at).next_back() {
            let cut = at.wrapping_sub(start) as usize;
            if fragment.data.len() > cut {
                let rest = fragment.data.split_off(cut);
                tail.insert(
                    at,
                    Fragment {
                        frame: fragment.frame,
                        data: rest,
                    },
                );
            }
        }
        tail
    }
}
