//! Command-line argument definitions.

use clap::Parser;
use std::path::PathBuf;

/// Extract DNS transactions and flow records from capture files.
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file to read (pcap or pcapng, optionally gzipped)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Write records as JSON lines to this file ('-' for stdout)
    #[arg(short = 'o', long = "output", value_name = "OUTPUT_FILE", default_value = "-")]
    pub output: String,

    /// Forward records to a collector instead of writing a file
    #[arg(long = "forward", value_name = "HOST:PORT", conflicts_with = "output")]
    pub forward: Option<String>,

    /// Seconds a query may wait for its response before timing out
    #[arg(long = "query-timeout", value_name = "SECONDS", default_value = "120")]
    pub query_timeout: u64,

    /// Seconds a resolved name stays usable for flow annotation
    #[arg(long = "cache-timeout", value_name = "SECONDS", default_value = "600")]
    pub cache_timeout: u64,

    /// Seconds of silence before a flow is summarized
    #[arg(long = "flow-timeout", value_name = "SECONDS", default_value = "600")]
    pub flow_timeout: u64,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Map the repeatable -v flag to a default log filter.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
