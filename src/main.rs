//! gleaner CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gleaner::capture::{PcapSource, Pipeline};
use gleaner::cli::Args;
use gleaner::config::{DnsConfig, FlowConfig};
use gleaner::output::{FileSink, ForwardSink, Sink};

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_filter().into()),
        )
        .init();

    let dns_cfg = DnsConfig {
        query_ttl: args.query_timeout,
        cache_ttl: args.cache_timeout,
        ..DnsConfig::default()
    };
    let flow_cfg = FlowConfig {
        timeout: args.flow_timeout,
        ..FlowConfig::default()
    };

    let sink: Box<dyn Sink> = match &args.forward {
        Some(endpoint) => Box::new(
            ForwardSink::connect(endpoint)
                .with_context(|| format!("cannot forward to {endpoint}"))?,
        ),
        None => Box::new(
            FileSink::create(&args.output)
                .with_context(|| format!("cannot open output {}", args.output))?,
        ),
    };

    let mut pipeline = Pipeline::new(dns_cfg, flow_cfg, sink)?;
    let mut source = PcapSource::open(&args.file)
        .with_context(|| format!("cannot open capture {}", args.file.display()))?;

    let stats = pipeline.run(&mut source)?;
    eprintln!(
        "{} frames read, {} decoded, {} errors",
        stats.frames, stats.decoded, stats.errors
    );
    Ok(())
}
