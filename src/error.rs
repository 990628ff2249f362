//! Error types for gleaner.

use thiserror::Error;

/// Main error type for gleaner operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading the capture source
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Invalid configuration, detected at setup
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error emitting a record to the output sink
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to pcap file reading.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File not found
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Invalid pcap format
    #[error("invalid pcap format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u16 },

    /// Truncated or malformed block in the capture
    #[error("bad capture block at frame {frame}: {reason}")]
    BadBlock { frame: u64, reason: String },
}

/// Errors in tracker or sink configuration, raised before any packet is
/// processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A TTL does not fit inside its timing wheel
    #[error("{what}: TTL {ttl} must satisfy 0 < ttl < {wheel} (wheel size)")]
    TtlOutOfRange { what: &'static str, ttl: u64, wheel: u64 },

    /// A timing wheel with zero slots
    #[error("{what}: wheel size must be non-zero")]
    EmptyWheel { what: &'static str },

    /// Malformed forwarding endpoint
    #[error("forward endpoint must be 'host:port', got {given:?}")]
    BadEndpoint { given: String },
}

/// Errors related to record emission.
#[derive(Error, Debug)]
pub enum OutputError {
    /// Could not connect to the forwarding endpoint
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Record serialization failure
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Write failure on an established sink
    #[error("sink write failed: {0}")]
    Write(std::io::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
