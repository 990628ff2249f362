//! gleaner - passive network telemetry from pcap captures.
//!
//! This library decodes packets from pcap files, maintains short-lived
//! correlation state (in-flight DNS transactions, name-resolution caches,
//! bidirectional flows) on a hashed timing wheel, and emits structured
//! telemetry records to an output sink.
//!
//! # Example
//!
//! ```no_run
//! use gleaner::capture::{PcapSource, Pipeline};
//! use gleaner::config::{DnsConfig, FlowConfig};
//! use gleaner::output::FileSink;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut source = PcapSource::open("capture.pcap")?;
//!     let sink = FileSink::create("-")?;
//!     let mut pipeline = Pipeline::new(DnsConfig::default(), FlowConfig::default(), Box::new(sink))?;
//!     let stats = pipeline.run(&mut source)?;
//!     eprintln!("{} frames", stats.frames);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod capture;
pub mod cli;
pub mod config;
pub mod decode;
pub mod error;
pub mod output;
pub mod track;

pub use error::{Error, Result};
