use thiserror::Error;

use crate::segment::FrameId;

/// Per-segment failures. None of these abort an analysis run; the caller
/// collects them and moves on to the next frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("frame {frame}: malformed segment: {reason}")]
    Malformed { frame: FrameId, reason: String },

    #[error("frame {frame}: no flow can be resolved for {src} -> {dst}")]
    Unresolvable {
        frame: FrameId,
        src: String,
        dst: String,
    },

    #[error("frame {frame}: not analyzed during the first pass")]
    NotAnalyzed { frame: FrameId },
}

impl SegmentError {
    pub fn frame(&self) -> FrameId {
        match self {
            SegmentError::Malformed { frame, .. }
            | SegmentError::Unresolvable { frame, .. }
            | SegmentError::NotAnalyzed { frame } => *frame,
        }
    }
}
