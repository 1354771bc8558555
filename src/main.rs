mod cli;

use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tcpscope::config::{self, Config};
use tcpscope::flow::{self, StreamId};
use tcpscope::follow::FollowRecord;
use tcpscope::reassembly::{ConsumeAll, ConsumeResult, Pdu, PduConsumer};
use tcpscope::{Analyzer, Segment};

fn main() {
    let args = cli::Cli::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&args, &config) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// Payload made of back-to-back messages of one size.
struct FixedLength(usize);

impl PduConsumer for FixedLength {
    fn consume(&mut self, pdu: &Pdu<'_>) -> ConsumeResult {
        let len = pdu.data.len();
        if len < self.0 {
            ConsumeResult::NeedMore(self.0 - len)
        } else if len > self.0 {
            ConsumeResult::ConsumedPrefix(self.0)
        } else {
            ConsumeResult::Consumed
        }
    }
}

#[derive(Serialize)]
struct FollowLine<'a> {
    stream: StreamId,
    #[serde(flatten)]
    record: &'a FollowRecord,
}

fn run(args: &cli::Cli, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let segments = read_segments(&args.input)?;
    tracing::info!(segments = segments.len(), "input loaded");

    let mut consumer: Box<dyn PduConsumer> = match args.message_len {
        Some(len) if len > 0 => Box::new(FixedLength(len)),
        _ => Box::new(ConsumeAll),
    };
    let mut analyzer = Analyzer::new(config);
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let print_reports = !config.output.quiet;

    let mut errors = 0usize;
    for segment in &segments {
        match analyzer.process(segment, true, consumer.as_mut()) {
            Ok(report) => {
                if print_reports && !args.second_pass {
                    serde_json::to_writer(&mut out, &report)?;
                    writeln!(out)?;
                }
            }
            Err(err) => {
                tracing::warn!(frame = err.frame(), "{}", err);
                errors += 1;
            }
        }
    }
    let flushed = analyzer.flush(consumer.as_mut());

    if args.second_pass {
        for segment in &segments {
            // Frames rejected on the first pass fail again here; already counted.
            if let Ok(report) = analyzer.process(segment, false, consumer.as_mut()) {
                if print_reports {
                    serde_json::to_writer(&mut out, &report)?;
                    writeln!(out)?;
                }
            }
        }
        analyzer.replay_flush(consumer.as_mut());
    }
    out.flush()?;

    if let Some(path) = &config.output.pdus {
        write_json_lines(path, analyzer.all_deliveries())?;
        tracing::info!(path = %path.display(), "pdus written");
    }
    if let Some(path) = &config.output.follow {
        let lines = analyzer.flows().flat_map(|flow| {
            flow.follow_records().iter().map(move |record| FollowLine {
                stream: flow.stream(),
                record,
            })
        });
        write_json_lines(path, lines)?;
        tracing::info!(path = %path.display(), "follow stream written");
    }
    if config.output.export_json.is_some() || config.output.export_csv.is_some() {
        let snapshot = analyzer.snapshot();
        if let Some(path) = &config.output.export_json {
            flow::write_flow_json(path.as_ref(), &snapshot)?;
        }
        if let Some(path) = &config.output.export_csv {
            flow::write_flow_csv(path.as_ref(), &snapshot)?;
        }
    }

    tracing::info!(
        segments = segments.len(),
        errors,
        flows = analyzer.flows().count(),
        flushed = flushed.len(),
        "analysis complete"
    );
    Ok(())
}

/// One segment per line; blank lines are skipped, unparseable ones logged.
fn read_segments(path: &Path) -> Result<Vec<Segment>, Box<dyn std::error::Error>> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };
    let mut segments = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Segment>(&line) {
            Ok(segment) => segments.push(segment),
            Err(err) => tracing::warn!(line = index + 1, "skipping unparseable segment: {}", err),
        }
    }
    Ok(segments)
}

fn write_json_lines<T: Serialize>(
    path: &Path,
    items: impl IntoIterator<Item = T>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = BufWriter::new(File::create(path)?);
    for item in items {
        serde_json::to_writer(&mut writer, &item)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

fn load_config(args: &cli::Cli) -> Result<Config, config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if args.absolute_seq {
        config.analysis.relative_sequence_numbers = false;
    }
    if args.no_analysis {
        config.analysis.analyze_sequence = false;
    }
    if args.no_reassembly {
        config.reassembly.enabled = false;
    }
    if args.no_ooo {
        config.reassembly.out_of_order = false;
    }
    if args.quiet {
        config.output.quiet = true;
    }
    if let Some(value) = &args.pdus {
        config.output.pdus = Some(value.clone());
    }
    if let Some(value) = &args.follow {
        config.output.follow = Some(value.clone());
    }
    if let Some(value) = &args.export_json {
        config.output.export_json = Some(value.clone());
    }
    if let Some(value) = &args.export_csv {
        config.output.export_csv = Some(value.clone());
    }

    Ok(config)
}
