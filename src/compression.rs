use std::io::{Read, Write};

use flate2::Compression;

use crate::error::{try_alloc, Error, Result};

/// How the payload blob is stored on disk. The whole payload is one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCompression {
    None,
    Zlib(Compression),
}

impl PayloadCompression {
    pub fn from_flag(compressed: bool) -> Self {
        if compressed {
            Self::Zlib(Compression::default())
        } else {
            Self::None
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Zlib(_))
    }

    /// Encodes `payload` into its on-disk form.
    pub fn compress(&self, payload: &[u8], mut writer: impl Write) -> Result<u64> {
        let written = match *self {
            PayloadCompression::None => {
                writer
                    .write_all(payload)
                    .map_err(Error::write("payload"))?;
                payload.len() as u64
            }
            PayloadCompression::Zlib(level) => {
                let mut reader = flate2::read::ZlibEncoder::new(payload, level);
                std::io::copy(&mut reader, &mut writer).map_err(Error::write("compressed payload"))?
            }
        };
        Ok(written)
    }

    /// Decodes a stored payload. The result must be exactly `expected_len` bytes long.
    pub fn decompress(&self, raw: Vec<u8>, expected_len: usize) -> Result<Vec<u8>> {
        let payload = match *self {
            PayloadCompression::None => {
                if raw.len() != expected_len {
                    return Err(Error::OutOfRange(format!(
                        "payload is {} bytes, entries describe {expected_len}",
                        raw.len()
                    )));
                }
                raw
            }
            PayloadCompression::Zlib(_) => {
                let mut payload = try_alloc(expected_len)?;
                // One extra byte is enough to notice a stream longer than declared.
                flate2::read::ZlibDecoder::new(&raw[..])
                    .take(expected_len as u64 + 1)
                    .read_to_end(&mut payload)
                    .map_err(Error::read("compressed payload"))?;

                if payload.len() != expected_len {
                    return Err(Error::Read {
                        what: "compressed payload",
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!(
                                "inflated to {} bytes, header declares {expected_len}",
                                payload.len()
                            ),
                        ),
                    });
                }
                payload
            }
        };
        Ok(payload)
    }
}
