//! The input record: one observed TCP segment, already parsed out of its IP
//! packet by an external dissector.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::SegmentError;
use crate::seq;

/// Capture-wide frame number.
pub type FrameId = u64;

/// Largest segment length accepted. Anything at or beyond a quarter of the
/// sequence space breaks serial-number comparisons.
pub const MAX_SEGMENT_LEN: u32 = 0x4000_0000;

bitflags! {
    // Bit positions [ CWR, ECE, URG, ACK, PSH, RST, SYN, FIN ]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(from = "u8", into = "u8")]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl From<u8> for TcpFlags {
    fn from(bits: u8) -> Self {
        TcpFlags::from_bits_retain(bits)
    }
}

impl From<TcpFlags> for u8 {
    fn from(flags: TcpFlags) -> Self {
        flags.bits()
    }
}

impl fmt::Display for TcpFlags {
    /// Formats like "[SYN, ACK]".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(TcpFlags::SYN) {
            parts.push("SYN");
        }
        if self.contains(TcpFlags::ACK) {
            parts.push("ACK");
        }
        if self.contains(TcpFlags::FIN) {
            parts.push("FIN");
        }
        if self.contains(TcpFlags::RST) {
            parts.push("RST");
        }
        if self.contains(TcpFlags::PSH) {
            parts.push("PSH");
        }
        if self.contains(TcpFlags::URG) {
            parts.push("URG");
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "SocketAddr", into = "SocketAddr")]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Endpoint {
            ip: ip.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        SocketAddr::new(endpoint.ip, endpoint.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::from(*self))
    }
}

/// One SACK block as carried in the option: `[left, right)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SackBlock {
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub frame: FrameId,
    /// Capture timestamp, seconds.
    pub ts: f64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    #[serde(default)]
    pub ack: u32,
    pub flags: TcpFlags,
    #[serde(default)]
    pub window: u16,
    /// Shift carried by the window-scale option, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_scale: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sack: Vec<SackBlock>,
    /// Payload length as reported on the wire.
    pub seglen: u32,
    /// Captured payload; shorter than `seglen` when the capture was truncated.
    #[serde(default, with = "hex")]
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn new(
        frame: FrameId,
        ts: f64,
        src: Endpoint,
        dst: Endpoint,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
    ) -> Self {
        Segment {
            frame,
            ts,
            src,
            dst,
            seq,
            ack,
            flags,
            window: 65535,
            window_scale: None,
            sack: Vec::new(),
            seglen: 0,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self.seglen = self.payload.len() as u32;
        self
    }

    /// Override the on-wire length, e.g. to model a truncated capture.
    pub fn with_seglen(mut self, seglen: u32) -> Self {
        self.seglen = seglen;
        self
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn with_window_scale(mut self, shift: u8) -> Self {
        self.window_scale = Some(shift);
        self
    }

    pub fn with_sack(mut self, blocks: impl IntoIterator<Item = (u32, u32)>) -> Self {
        self.sack = blocks
            .into_iter()
            .map(|(left, right)| SackBlock { left, right })
            .collect();
        self
    }

    #[inline]
    pub fn syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    #[inline]
    pub fn rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    #[inline]
    pub fn psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    /// The acknowledgment number, only meaningful with ACK set.
    #[inline]
    pub fn ack_number(&self) -> Option<u32> {
        if self.flags.contains(TcpFlags::ACK) {
            Some(self.ack)
        } else {
            None
        }
    }

    /// Any of SYN, FIN or RST.
    #[inline]
    pub fn is_control(&self) -> bool {
        self.flags
            .intersects(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST)
    }

    /// Sequence space consumed: payload plus one for SYN or FIN.
    pub fn seq_len(&self) -> u32 {
        if self.flags.intersects(TcpFlags::SYN | TcpFlags::FIN) {
            self.seglen + 1
        } else {
            self.seglen
        }
    }

    /// First sequence number after this segment.
    pub fn next_seq(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }

    pub fn is_truncated(&self) -> bool {
        (self.payload.len() as u32) < self.seglen
    }

    /// Reject field combinations that cannot come from a real segment.
    pub fn validate(&self) -> Result<(), SegmentError> {
        let malformed = |reason: String| SegmentError::Malformed {
            frame: self.frame,
            reason,
        };
        if self.seglen >= MAX_SEGMENT_LEN {
            return Err(malformed(format!(
                "segment length {} exceeds the sequence window",
                self.seglen
            )));
        }
        if self.payload.len() as u64 > self.seglen as u64 {
            return Err(malformed(format!(
                "captured payload ({} bytes) longer than segment length {}",
                self.payload.len(),
                self.seglen
            )));
        }
        if !self.ts.is_finite() {
            return Err(malformed("timestamp is not finite".into()));
        }
        for block in &self.sack {
            if seq::lt(block.right, block.left) {
                return Err(malformed(format!(
                    "SACK block {}-{} ends before it starts",
                    block.left, block.right
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} -> {} {} seq={} ack={} win={} len={}",
            self.frame,
            self.src,
            self.dst,
            self.flags,
            self.seq,
            self.ack,
            self.window,
            self.seglen
        )
    }
}
