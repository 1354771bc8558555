use clap::Parser;
use std::path::PathBuf;

/// tcpscope: replay parsed TCP segments through sequence analysis and reassembly
#[derive(Parser, Debug)]
#[command(name = "tcpscope", version, about)]
pub struct Cli {
    /// JSON-lines file of segments, one per line ("-" for stdin)
    pub input: PathBuf,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Report raw sequence numbers instead of relative ones
    #[arg(long)]
    pub absolute_seq: bool,

    /// Skip sequence analysis (flows and reassembly still run)
    #[arg(long)]
    pub no_analysis: bool,

    /// Hand every payload to the consumer as is
    #[arg(long)]
    pub no_reassembly: bool,

    /// Do not hold segments that arrive ahead of a gap
    #[arg(long)]
    pub no_ooo: bool,

    /// Treat the payload as fixed-size messages of this many bytes
    #[arg(long)]
    pub message_len: Option<usize>,

    /// Run a second, read-only pass and report from it
    #[arg(long)]
    pub second_pass: bool,

    /// Write reassembled PDUs as JSON lines to this path
    #[arg(long)]
    pub pdus: Option<PathBuf>,

    /// Write follow-stream records as JSON lines to this path
    #[arg(long)]
    pub follow: Option<PathBuf>,

    /// Export flow summaries as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export flow summaries as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Do not print per-frame reports
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
