//! Forwarding sink: length-prefixed record frames over TCP.

use std::io::Write;
use std::net::TcpStream;

use tracing::debug;

use crate::error::{ConfigError, Error, OutputError};

use super::{Doc, Sink};

/// Tag prefix applied to every forwarded record.
const TAG_PREFIX: &str = "gleaner";

/// Streams records to a remote collector.
///
/// Each record is framed as a big-endian u32 length followed by the JSON
/// encoding of a two-element array: `[tag, [[ts, doc]]]`.
pub struct ForwardSink {
    stream: TcpStream,
    endpoint: String,
}

impl ForwardSink {
    /// Connect to `host:port`.
    ///
    /// A malformed endpoint is a configuration error; a refused connection
    /// is an output error. Both are fatal at setup.
    pub fn connect(endpoint: &str) -> Result<Self, Error> {
        let bad_endpoint = || ConfigError::BadEndpoint {
            given: endpoint.to_string(),
        };
        let (host, port) = endpoint.rsplit_once(':').ok_or_else(bad_endpoint)?;
        if host.is_empty() {
            return Err(bad_endpoint().into());
        }
        let port: u16 = port.parse().map_err(|_| bad_endpoint())?;

        let stream = TcpStream::connect((host, port)).map_err(|source| {
            OutputError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        debug!(endpoint, "forward sink connected");

        Ok(Self {
            stream,
            endpoint: endpoint.to_string(),
        })
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Sink for ForwardSink {
    fn emit(&mut self, tag: &str, ts: i64, doc: Doc) -> Result<(), OutputError> {
        let tagged = format!("{TAG_PREFIX}.{tag}");
        let frame = serde_json::to_vec(&(tagged, [(ts, &doc)]))?;

        self.stream
            .write_all(&(frame.len() as u32).to_be_bytes())
            .map_err(OutputError::Write)?;
        self.stream.write_all(&frame).map_err(OutputError::Write)?;
        Ok(())
    }
}
