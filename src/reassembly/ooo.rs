use std::collections::BTreeMap;

use crate::segment::FrameId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OooEntry {
    pub frame: FrameId,
    pub data: Vec<u8>,
}

impl OooEntry {
    pub fn end(&self, seq: u32) -> u32 {
        seq.wrapping_add(self.data.len() as u32)
    }
}

/// Segments that arrived beyond the contiguous frontier, keyed by relative
/// sequence number.
#[derive(Debug, Default)]
pub struct OutOfOrderBuffer {
    entries: BTreeMap<u32, OooEntry>,
}

impl OutOfOrderBuffer {
    pub fn new() -> Self {
        OutOfOrderBuffer::default()
    }

    /// Two segments at the same sequence keep whichever carries more bytes.
    pub fn insert(&mut self, seq: u32, frame: FrameId, data: Vec<u8>) {
        match self.entries.get(&seq) {
            Some(existing) if existing.data.len() >= data.len() => {}
            _ => {
                self.entries.insert(seq, OooEntry { frame, data });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<(u32, &OooEntry)> {
        self.entries.iter().next().map(|(seq, entry)| (*seq, entry))
    }

    /// Remove the lowest entry if it starts at or before `frontier`.
    pub fn pop_ready(&mut self, frontier: u32) -> Option<(u32, OooEntry)> {
        let (&seq, _) = self.entries.range(..=frontier).next()?;
        self.entries.remove(&seq).map(|entry| (seq, entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &OooEntry)> {
        self.entries.iter().map(|(seq, entry)| (*seq, entry))
    }
}
