//! Block compression used by the page engine.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LEVEL: u32 = 6;
pub const MAX_LEVEL: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CompressAlg {
    #[default]
    None,
    Zlib,
}

/// Algorithm plus level, as selected by the caller of a page transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compression {
    pub alg: CompressAlg,
    pub level: u32,
}

impl Default for Compression {
    fn default() -> Self {
        Self::none()
    }
}

impl Compression {
    pub fn none() -> Self {
        Self {
            alg: CompressAlg::None,
            level: 0,
        }
    }

    pub fn zlib(level: u32) -> Self {
        Self {
            alg: CompressAlg::Zlib,
            level: level.min(MAX_LEVEL),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.alg != CompressAlg::None
    }

    /// Compress `src`. With no algorithm selected the bytes are copied.
    pub fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
        match self.alg {
            CompressAlg::None => Ok(src.to_vec()),
            CompressAlg::Zlib => {
                let level = flate2::Compression::new(self.level.min(MAX_LEVEL));
                let mut enc = ZlibEncoder::new(Vec::with_capacity(src.len() / 2), level);
                enc.write_all(src)?;
                enc.finish()
            }
        }
    }

    /// Inflate `src`, which must expand to exactly `expected_len` bytes.
    pub fn decompress(&self, src: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        let out = match self.alg {
            CompressAlg::None => src.to_vec(),
            CompressAlg::Zlib => {
                let mut out = Vec::with_capacity(expected_len);
                ZlibDecoder::new(src)
                    .take(expected_len as u64 + 1)
                    .read_to_end(&mut out)?;
                out
            }
        };
        if out.len() != expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "block expands to {} bytes, expected {}",
                    out.len(),
                    expected_len
                ),
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_shrinks_repetitive_pages() {
        let page: Vec<u8> = (0..8192u32).map(|i| (i % 7) as u8).collect();
        let c = Compression::zlib(DEFAULT_LEVEL);
        let packed = c.compress(&page).unwrap();
        assert!(packed.len() < page.len() / 4);
        assert_eq!(c.decompress(&packed, page.len()).unwrap(), page);
    }

    #[test]
    fn wrong_expected_length_is_rejected() {
        let c = Compression::zlib(1);
        let packed = c.compress(&[1u8; 100]).unwrap();
        assert!(c.decompress(&packed, 99).is_err());
        assert!(c.decompress(&packed, 101).is_err());
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(Compression::zlib(42).level, MAX_LEVEL);
        assert!(!Compression::none().is_enabled());
    }
}
