//! File sink: JSON lines to a file or stdout.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::OutputError;

use super::{Doc, Sink};

/// Writes each record as one JSON line: `[tag, ts, doc]`.
pub struct FileSink {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl FileSink {
    /// Open the output target. `"-"` writes to stdout.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let writer: Box<dyn Write + Send> = if path.as_os_str() == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(path)?)
        };
        Ok(Self {
            writer: BufWriter::new(writer),
        })
    }
}

impl Sink for FileSink {
    fn emit(&mut self, tag: &str, ts: i64, doc: Doc) -> Result<(), OutputError> {
        serde_json::to_writer(&mut self.writer, &(tag, ts, &doc))?;
        self.writer.write_all(b"\n").map_err(OutputError::Write)?;
        self.writer.flush().map_err(OutputError::Write)?;
        Ok(())
    }
}
