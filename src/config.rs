use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::direction::WindowScale;

fn empty_path_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<PathBuf>::deserialize(deserializer)?;
    Ok(opt.and_then(|path| {
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub analysis: AnalysisConfig,
    pub reassembly: ReassemblyConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Which of the two timing heuristics gets the first look at a segment
/// whose sequence number did not advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetransmissionPrecedence {
    FastRetransmission,
    OutOfOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Run the sequence analysis engine at all.
    pub analyze_sequence: bool,
    /// Report seq/ack relative to each direction's base sequence.
    pub relative_sequence_numbers: bool,
    pub track_bytes_in_flight: bool,
    /// Report per-flow time since first frame and since previous frame.
    pub calculate_timestamps: bool,
    pub retransmission_precedence: RetransmissionPrecedence,
    /// Out-of-order threshold used until the handshake RTT is known.
    pub out_of_order_threshold_ms: f64,
    /// A retransmission this close to the last duplicate ACK counts as fast.
    pub fast_retransmission_window_ms: f64,
    /// Window scaling assumed when no SYN was seen: -1 unknown, -2 none,
    /// 0..=14 shift.
    pub default_window_scale: WindowScale,
    /// Per-direction cap on remembered unacknowledged segments.
    pub max_unacked_segments: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            analyze_sequence: true,
            relative_sequence_numbers: true,
            track_bytes_in_flight: true,
            calculate_timestamps: true,
            retransmission_precedence: RetransmissionPrecedence::FastRetransmission,
            out_of_order_threshold_ms: 3.0,
            fast_retransmission_window_ms: 20.0,
            default_window_scale: WindowScale::Unknown,
            max_unacked_segments: 10_000,
        }
    }
}

impl AnalysisConfig {
    pub(crate) fn out_of_order_threshold(&self) -> f64 {
        self.out_of_order_threshold_ms / 1000.0
    }

    pub(crate) fn fast_retransmission_window(&self) -> f64 {
        self.fast_retransmission_window_ms / 1000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Let the PDU consumer ask for more bytes than one segment holds.
    pub enabled: bool,
    /// Hold segments that arrive ahead of a gap until the gap is filled.
    pub out_of_order: bool,
    /// Per-direction cap on held out-of-order segments.
    pub max_out_of_order_segments: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            enabled: true,
            out_of_order: true,
            max_out_of_order_segments: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON lines of reassembled PDUs.
    #[serde(deserialize_with = "empty_path_none")]
    pub pdus: Option<PathBuf>,
    /// JSON lines of follow-stream records.
    #[serde(deserialize_with = "empty_path_none")]
    pub follow: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub export_json: Option<PathBuf>,
    #[serde(deserialize_with = "empty_path_none")]
    pub export_csv: Option<PathBuf>,
    /// Suppress per-frame reports on stdout.
    pub quiet: bool,
}
