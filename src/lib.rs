//! tcpscope: stateful TCP sequence analysis and segment reassembly.
//!
//! Feed already-parsed [`segment::Segment`] records, in capture order, to an
//! [`analyzer::Analyzer`]. Each call yields a per-frame report (flow,
//! direction, relative numbers, analysis flags, RTT/RTO, bytes in flight)
//! and hands reassembled payload ranges to a [`reassembly::PduConsumer`].

pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod direction;
pub mod error;
pub mod flow;
pub mod follow;
pub mod reassembly;
pub mod segment;
pub mod seq;

pub use analyzer::{Analyzer, SegmentReport};
pub use config::Config;
pub use error::SegmentError;
pub use segment::Segment;
