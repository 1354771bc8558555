//! Per-segment classification produced by the sequence analysis engine.

pub mod sequence;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::segment::FrameId;

pub use sequence::SequenceAnalyzer;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct AnalysisFlags: u32 {
        const RETRANSMISSION = 1 << 0;
        const LOST_PACKET = 1 << 1;
        const ACK_LOST_PACKET = 1 << 2;
        const KEEP_ALIVE = 1 << 3;
        const DUPLICATE_ACK = 1 << 4;
        const ZERO_WINDOW = 1 << 5;
        const ZERO_WINDOW_PROBE = 1 << 6;
        const ZERO_WINDOW_PROBE_ACK = 1 << 7;
        const KEEP_ALIVE_ACK = 1 << 8;
        const OUT_OF_ORDER = 1 << 9;
        const FAST_RETRANSMISSION = 1 << 10;
        const WINDOW_UPDATE = 1 << 11;
        const WINDOW_FULL = 1 << 12;
        const REUSED_PORTS = 1 << 13;
        const SPURIOUS_RETRANSMISSION = 1 << 14;

        /// At most one of these is ever set on a segment.
        const RETRANSMISSION_FAMILY = Self::RETRANSMISSION.bits()
            | Self::FAST_RETRANSMISSION.bits()
            | Self::OUT_OF_ORDER.bits()
            | Self::SPURIOUS_RETRANSMISSION.bits();
    }
}

impl From<u32> for AnalysisFlags {
    fn from(bits: u32) -> Self {
        AnalysisFlags::from_bits_truncate(bits)
    }
}

impl From<AnalysisFlags> for u32 {
    fn from(flags: AnalysisFlags) -> Self {
        flags.bits()
    }
}

const FLAG_NAMES: [(AnalysisFlags, &str); 15] = [
    (AnalysisFlags::REUSED_PORTS, "reused_ports"),
    (AnalysisFlags::LOST_PACKET, "lost_segment"),
    (AnalysisFlags::ACK_LOST_PACKET, "ack_lost_segment"),
    (AnalysisFlags::KEEP_ALIVE, "keep_alive"),
    (AnalysisFlags::KEEP_ALIVE_ACK, "keep_alive_ack"),
    (AnalysisFlags::ZERO_WINDOW, "zero_window"),
    (AnalysisFlags::ZERO_WINDOW_PROBE, "zero_window_probe"),
    (AnalysisFlags::ZERO_WINDOW_PROBE_ACK, "zero_window_probe_ack"),
    (AnalysisFlags::WINDOW_UPDATE, "window_update"),
    (AnalysisFlags::WINDOW_FULL, "window_full"),
    (AnalysisFlags::DUPLICATE_ACK, "dup_ack"),
    (AnalysisFlags::RETRANSMISSION, "retransmission"),
    (AnalysisFlags::FAST_RETRANSMISSION, "fast_retransmission"),
    (AnalysisFlags::SPURIOUS_RETRANSMISSION, "spurious_retransmission"),
    (AnalysisFlags::OUT_OF_ORDER, "out_of_order"),
];

impl fmt::Display for AnalysisFlags {
    /// Comma separated, e.g. "lost_segment,dup_ack".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in FLAG_NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Retransmission timeout inferred from a repeated segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rto {
    /// Seconds since the original transmission.
    pub delta: f64,
    /// Frame holding the original transmission.
    pub frame: FrameId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DupAck {
    /// 1 for the first duplicate, then increasing.
    pub num: u32,
    /// Last ACK in this direction that was not a duplicate.
    pub frame: FrameId,
}

/// Everything the engine concluded about one segment occurrence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub flags: AnalysisFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in_flight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_bytes_sent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rto: Option<Rto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dupack: Option<DupAck>,
    /// Frame whose data this segment acknowledges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_acked: Option<FrameId>,
    /// Seconds between `frame_acked` and this segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_rtt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_rtt: Option<f64>,
}

impl Annotation {
    pub fn has(&self, flag: AnalysisFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_retransmission(&self) -> bool {
        self.flags.intersects(AnalysisFlags::RETRANSMISSION_FAMILY)
    }
}
