//! Capture file reading.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use tracing::debug;

use crate::error::CaptureError;

const BUFFER_SIZE: usize = 65536;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Link type we know how to decode (DLT_EN10MB).
const LINKTYPE_ETHERNET: u16 = 1;

/// One captured frame with its capture-time metadata.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Capture timestamp, whole seconds.
    pub ts_sec: i64,
    /// Capture timestamp, microsecond remainder.
    pub ts_usec: u32,
    /// Original length on the wire, which may exceed the captured bytes.
    pub orig_len: u32,
    /// Captured link-layer bytes.
    pub data: Vec<u8>,
}

/// Reader for pcap and pcapng capture files, with transparent gzip
/// decompression. Only Ethernet link types are accepted.
pub struct PcapSource {
    inner: SourceInner,
    frames: u64,
    link_type: u16,
    // Divisor turning a legacy timestamp fraction into microseconds: 1 for
    // microsecond captures, 1000 for nanosecond ones.
    frac_div: u32,
}

impl std::fmt::Debug for PcapSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcapSource")
            .field("frames", &self.frames)
            .field("link_type", &self.link_type)
            .field("frac_div", &self.frac_div)
            .finish_non_exhaustive()
    }
}

enum SourceInner {
    Legacy(LegacyPcapReader<BufReader<Box<dyn Read + Send>>>),
    Ng(PcapNGReader<BufReader<Box<dyn Read + Send>>>),
}

impl PcapSource {
    /// Open a capture file, sniffing gzip compression and pcap flavor from
    /// the leading magic bytes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let gzipped = is_gzipped(path)?;

        let mut reader = open_reader(path, gzipped)?;
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| CaptureError::InvalidFormat {
                reason: "file too short for a capture header".to_string(),
            })?;

        // Re-open: the format readers want to see the magic themselves.
        drop(reader);
        let reader = open_reader(path, gzipped)?;

        let (inner, frac_div) = match magic {
            // Legacy pcap, either endianness, microsecond fractions.
            [0xd4, 0xc3, 0xb2, 0xa1] | [0xa1, 0xb2, 0xc3, 0xd4] => {
                (Self::open_legacy(reader)?, 1)
            }
            // Legacy pcap with nanosecond fractions.
            [0x4d, 0x3c, 0xb2, 0xa1] | [0xa1, 0xb2, 0x3c, 0x4d] => {
                (Self::open_legacy(reader)?, 1000)
            }
            [0x0a, 0x0d, 0x0d, 0x0a] => (
                SourceInner::Ng(PcapNGReader::new(BUFFER_SIZE, reader).map_err(|e| {
                    CaptureError::InvalidFormat {
                        reason: format!("bad pcapng header: {e}"),
                    }
                })?),
                1,
            ),
            _ => {
                return Err(CaptureError::InvalidFormat {
                    reason: format!("unknown magic number: {magic:02x?}"),
                })
            }
        };

        Ok(Self {
            inner,
            frames: 0,
            link_type: LINKTYPE_ETHERNET,
            frac_div,
        })
    }

    fn open_legacy(
        reader: BufReader<Box<dyn Read + Send>>,
    ) -> Result<SourceInner, CaptureError> {
        Ok(SourceInner::Legacy(
            LegacyPcapReader::new(BUFFER_SIZE, reader).map_err(|e| {
                CaptureError::InvalidFormat {
                    reason: format!("bad pcap header: {e}"),
                }
            })?,
        ))
    }

    /// Frames returned so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Read the next frame, or `None` at end of capture.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let frame = if matches!(self.inner, SourceInner::Legacy(_)) {
            self.next_legacy()?
        } else {
            self.next_ng()?
        };
        if frame.is_some() {
            if self.link_type != LINKTYPE_ETHERNET {
                return Err(CaptureError::UnsupportedLinkType {
                    link_type: self.link_type,
                });
            }
            self.frames += 1;
        }
        Ok(frame)
    }

    fn next_legacy(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let SourceInner::Legacy(reader) = &mut self.inner else {
            unreachable!()
        };
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.link_type = header.network.0 as u16;
                            reader.consume(offset);
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let frame = RawFrame {
                                ts_sec: packet.ts_sec as i64,
                                // ts_usec is the raw fraction field; for
                                // nanosecond captures it holds nanoseconds.
                                ts_usec: packet.ts_usec / self.frac_div,
                                orig_len: packet.origlen,
                                data: packet.data.to_vec(),
                            };
                            reader.consume(offset);
                            return Ok(Some(frame));
                        }
                        _ => reader.consume(offset),
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| CaptureError::BadBlock {
                        frame: self.frames,
                        reason: format!("refill failed: {e}"),
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::BadBlock {
                        frame: self.frames,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn next_ng(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let SourceInner::Ng(reader) = &mut self.inner else {
            unreachable!()
        };
        loop {
            match reader.next() {
                Ok((offset, block)) => {
                    match block {
                        PcapBlockOwned::NG(ng) => {
                            use pcap_parser::pcapng::Block;
                            match ng {
                                Block::InterfaceDescription(idb) => {
                                    self.link_type = idb.linktype.0 as u16;
                                    reader.consume(offset);
                                }
                                Block::EnhancedPacket(epb) => {
                                    // Interface time units, microseconds by
                                    // convention.
                                    let us =
                                        ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                                    let frame = RawFrame {
                                        ts_sec: (us / 1_000_000) as i64,
                                        ts_usec: (us % 1_000_000) as u32,
                                        orig_len: epb.origlen,
                                        data: epb.data.to_vec(),
                                    };
                                    reader.consume(offset);
                                    return Ok(Some(frame));
                                }
                                // Simple packet blocks carry no timestamp,
                                // so they cannot drive the virtual clocks.
                                Block::SimplePacket(_) => {
                                    debug!("skipping untimestamped simple packet block");
                                    reader.consume(offset);
                                }
                                _ => reader.consume(offset),
                            }
                        }
                        _ => reader.consume(offset),
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    reader.refill().map_err(|e| CaptureError::BadBlock {
                        frame: self.frames,
                        reason: format!("refill failed: {e}"),
                    })?;
                }
                Err(e) => {
                    return Err(CaptureError::BadBlock {
                        frame: self.frames,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

fn open_reader(
    path: &Path,
    gzipped: bool,
) -> Result<BufReader<Box<dyn Read + Send>>, CaptureError> {
    let file = File::open(path).map_err(|_| CaptureError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let reader: Box<dyn Read + Send> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(BufReader::with_capacity(BUFFER_SIZE, reader))
}

fn is_gzipped(path: &Path) -> Result<bool, CaptureError> {
    let mut file = File::open(path).map_err(|_| CaptureError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        // Shorter than two bytes: let the format sniffing report it.
        Err(_) => Ok(false),
    }
}
