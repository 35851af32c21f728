//! Chain payload compression
//!
//! A chain is compressed as one stream before it is split into pages.
//! Compression is kept only when it saves at least 5%.

use std::io::{Read, Write};

use crate::error::{Result, VaultError};

/// Output must be below this fraction of the input to be kept
const MAX_RATIO_PERCENT: usize = 95;

/// Algorithm id stored in the file header and on each overflow page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    None = 0,
    /// Primary algorithm
    Zstd = 1,
    /// Faster alternative
    Deflate = 2,
}

impl CompressionAlgorithm {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Zstd),
            2 => Ok(CompressionAlgorithm::Deflate),
            other => Err(VaultError::UnsupportedFeature(format!(
                "compression algorithm {}",
                other
            ))),
        }
    }

    /// Compress `data`, or `None` when the result would not be worth storing
    pub fn compress(self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = match self {
            CompressionAlgorithm::None => return Ok(None),
            CompressionAlgorithm::Zstd => zstd::bulk::compress(data, 0)?,
            CompressionAlgorithm::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(data.len() / 2),
                    flate2::Compression::fast(),
                );
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };

        if out.len() * 100 < data.len() * MAX_RATIO_PERCENT {
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// Decompress exactly `expected_len` bytes
    ///
    /// Output is capped at `expected_len + 1` bytes so a damaged stream
    /// cannot balloon memory; any length other than `expected_len` fails.
    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let limit = expected_len as u64 + 1;
        let mut out = Vec::with_capacity(expected_len);

        match self {
            CompressionAlgorithm::None => out.extend_from_slice(data),
            CompressionAlgorithm::Zstd => {
                zstd::stream::read::Decoder::new(data)?
                    .take(limit)
                    .read_to_end(&mut out)?;
            }
            CompressionAlgorithm::Deflate => {
                flate2::read::DeflateDecoder::new(data)
                    .take(limit)
                    .read_to_end(&mut out)?;
            }
        }

        if out.len() != expected_len {
            return Err(VaultError::Serialization(format!(
                "decompressed {} bytes, expected {}",
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}
