//! gzip streams over location-transparent files.
//!
//! A `GzFile` compresses on write and decompresses on read while the bytes
//! themselves go through a `FioFile`, so a compressed WAL segment can be
//! written straight into a remote backup repository.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;

use crate::compress::MAX_LEVEL;
use crate::error::{FioError, Result};
use crate::file::{FioFile, OpenFlags};
use crate::fio::Fio;
use crate::location::Location;

const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GzMode {
    Read,
    Write,
    Append,
}

enum Stream {
    Reader(MultiGzDecoder<FioFile>),
    Writer(GzEncoder<FioFile>),
    Closed,
}

/// Compressed stream opened by `Fio::gzopen`
pub struct GzFile {
    stream: Stream,
    /// Uncompressed offset
    pos: u64,
    eof: bool,
    last_error: Option<String>,
}

impl std::fmt::Debug for GzFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.stream {
            Stream::Reader(_) => "read",
            Stream::Writer(_) => "write",
            Stream::Closed => "closed",
        };
        f.debug_struct("GzFile")
            .field("mode", &mode)
            .field("pos", &self.pos)
            .field("eof", &self.eof)
            .finish()
    }
}

/// Split a gzopen mode ("rb", "wb9", "a") into direction and optional level.
fn parse_mode(mode: &str) -> Result<(GzMode, Option<u32>)> {
    let mut dir = None;
    let mut level = None;
    for c in mode.chars() {
        match c {
            'r' if dir.is_none() => dir = Some(GzMode::Read),
            'w' if dir.is_none() => dir = Some(GzMode::Write),
            'a' if dir.is_none() => dir = Some(GzMode::Append),
            'b' => {}
            '0'..='9' => level = c.to_digit(10),
            _ => return Err(bad_mode(mode)),
        }
    }
    Ok((dir.ok_or_else(|| bad_mode(mode))?, level))
}

fn bad_mode(mode: &str) -> FioError {
    FioError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid gzip mode {:?}", mode),
    ))
}

impl Fio {
    /// Open a gzip stream. A digit in `mode` overrides `level`.
    pub fn gzopen(&self, path: impl AsRef<Path>, mode: &str, level: u32, loc: Location) -> Result<GzFile> {
        let (dir, mode_level) = parse_mode(mode)?;
        let level = mode_level.unwrap_or(level).min(MAX_LEVEL);
        let flags = match dir {
            GzMode::Read => OpenFlags::read_only(),
            GzMode::Write => OpenFlags::create_truncate(),
            GzMode::Append => OpenFlags::from_bits(OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE),
        };
        let file = self.open(path, flags, loc)?;
        let stream = match dir {
            GzMode::Read => Stream::Reader(MultiGzDecoder::new(file)),
            GzMode::Write | GzMode::Append => {
                Stream::Writer(GzEncoder::new(file, flate2::Compression::new(level)))
            }
        };
        Ok(GzFile {
            stream,
            pos: 0,
            eof: false,
            last_error: None,
        })
    }
}

impl GzFile {
    /// True once a read has hit the end of the compressed data.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Message of the most recent failed operation.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Finish the gzip trailer (when writing) and close the file.
    pub fn close(mut self) -> Result<()> {
        match mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Reader(dec) => dec.into_inner().close(),
            Stream::Writer(enc) => enc.finish()?.close(),
            Stream::Closed => Ok(()),
        }
    }

    fn note<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn rewind(&mut self) -> io::Result<()> {
        let Stream::Reader(dec) = mem::replace(&mut self.stream, Stream::Closed) else {
            return Err(io::ErrorKind::Unsupported.into());
        };
        let mut file = dec.into_inner();
        file.seek(SeekFrom::Start(0))?;
        self.stream = Stream::Reader(MultiGzDecoder::new(file));
        self.pos = 0;
        self.eof = false;
        Ok(())
    }

    fn seek_inner(&mut self, target: u64) -> io::Result<u64> {
        match self.stream {
            Stream::Reader(_) => {
                if target < self.pos {
                    self.rewind()?;
                }
                let want = target - self.pos;
                let skipped = io::copy(&mut Read::take(&mut *self, want), &mut io::sink())?;
                if skipped < want {
                    self.eof = true;
                }
                Ok(self.pos)
            }
            Stream::Writer(_) => {
                if target < self.pos {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cannot seek backwards in a compressed write stream",
                    ));
                }
                let zeros = [0u8; ZERO_CHUNK];
                let mut remaining = target - self.pos;
                while remaining > 0 {
                    let n = remaining.min(ZERO_CHUNK as u64) as usize;
                    self.write_all(&zeros[..n])?;
                    remaining -= n as u64;
                }
                Ok(self.pos)
            }
            Stream::Closed => Err(closed()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "gzip stream is closed")
}

impl Read for GzFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &mut self.stream {
            Stream::Reader(dec) => dec.read(buf),
            Stream::Writer(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "gzip stream is open for writing",
            )),
            Stream::Closed => Err(closed()),
        };
        let n = self.note(result)?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for GzFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = match &mut self.stream {
            Stream::Writer(enc) => enc.write(buf),
            Stream::Reader(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "gzip stream is open for reading",
            )),
            Stream::Closed => Err(closed()),
        };
        let n = self.note(result)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = match &mut self.stream {
            Stream::Writer(enc) => enc.flush(),
            Stream::Reader(_) => Ok(()),
            Stream::Closed => Err(closed()),
        };
        self.note(result)
    }
}

/// Seeks address the uncompressed stream. Seeking from the end is not
/// possible without decoding everything.
impl Seek for GzFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(_) => {
                return self.note(Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "gzip streams cannot seek from the end",
                )))
            }
        };
        let Some(target) = target else {
            return self.note(Err(io::ErrorKind::InvalidInput.into()));
        };
        let result = self.seek_inner(target);
        self.note(result)
    }
}

impl Drop for GzFile {
    fn drop(&mut self) {
        if let Stream::Writer(enc) = mem::replace(&mut self.stream, Stream::Closed) {
            if let Err(e) = enc.finish() {
                warn!(error = %e, "failed to finish gzip stream on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wal_text() -> Vec<u8> {
        (0..20_000u32)
            .flat_map(|i| format!("record {i}\n").into_bytes())
            .collect()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(parse_mode("rb").unwrap(), (GzMode::Read, None));
        assert_eq!(parse_mode("wb9").unwrap(), (GzMode::Write, Some(9)));
        assert_eq!(parse_mode("a").unwrap(), (GzMode::Append, None));
        assert!(parse_mode("rw").is_err());
        assert!(parse_mode("b").is_err());
    }

    #[test]
    fn write_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000000010000000000000001.gz");
        let fio = Fio::default();
        let data = wal_text();

        let mut gz = fio.gzopen(&path, "wb", 6, Location::Local).unwrap();
        gz.write_all(&data).unwrap();
        gz.close().unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < data.len() as u64);

        let mut gz = fio.gzopen(&path, "rb", 0, Location::Local).unwrap();
        let mut back = Vec::new();
        gz.read_to_end(&mut back).unwrap();
        assert!(gz.eof());
        assert_eq!(back, data);
    }

    #[test]
    fn seek_on_read_rewinds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("seg.gz");
        let fio = Fio::default();
        let data = wal_text();
        let mut gz = fio.gzopen(&path, "w", 1, Location::Local).unwrap();
        gz.write_all(&data).unwrap();
        gz.close().unwrap();

        let mut gz = fio.gzopen(&path, "r", 0, Location::Local).unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(gz.seek(SeekFrom::Start(1000)).unwrap(), 1000);
        gz.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[1000..1009]);
        assert_eq!(gz.seek(SeekFrom::Current(-509)).unwrap(), 500);
        gz.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &data[500..509]);
        assert!(gz.seek(SeekFrom::End(0)).is_err());
        assert!(gz.last_error().is_some());
    }

    #[test]
    fn forward_seek_on_write_pads_zeros() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sparse.gz");
        let fio = Fio::default();
        let mut gz = fio.gzopen(&path, "w", 6, Location::Local).unwrap();
        gz.write_all(b"head").unwrap();
        assert_eq!(gz.seek(SeekFrom::Start(100)).unwrap(), 100);
        gz.write_all(b"tail").unwrap();
        assert!(gz.seek(SeekFrom::Start(10)).is_err());
        gz.close().unwrap();

        let mut back = Vec::new();
        fio.gzopen(&path, "r", 0, Location::Local)
            .unwrap()
            .read_to_end(&mut back)
            .unwrap();
        assert_eq!(back.len(), 104);
        assert_eq!(&back[..4], b"head");
        assert!(back[4..100].iter().all(|&b| b == 0));
        assert_eq!(&back[100..], b"tail");
    }

    #[test]
    fn appended_members_read_as_one_stream() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("history.gz");
        let fio = Fio::default();
        for part in [&b"first "[..], &b"second"[..]] {
            let mut gz = fio.gzopen(&path, "a", 6, Location::Local).unwrap();
            gz.write_all(part).unwrap();
            gz.close().unwrap();
        }
        let mut text = String::new();
        fio.gzopen(&path, "r", 0, Location::Local)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "first second");
    }
}
