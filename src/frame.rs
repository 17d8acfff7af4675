//! Frame encoding and decoding for the rfio wire protocol.
//!
//! A frame is one fixed-size header followed by exactly `size` payload
//! bytes. The header packs operation, handle and payload length into one
//! little-endian word with explicit shifts and masks; `arg` is a second word.
//! The stream has no resynchronization marker, so any short read is fatal to
//! the connection.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{channel_error, FioError, FrameError, Result};
use crate::protocol::{
    HANDLE_MASK, HANDLE_SHIFT, HEADER_SIZE, MAX_PAYLOAD, OP_MASK, OP_SHIFT, SIZE_MASK,
    SIZE_SHIFT,
};

/// Operation codes. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Open = 0,
    Close = 1,
    Write = 2,
    Rename = 3,
    Symlink = 4,
    Unlink = 5,
    Mkdir = 6,
    Chmod = 7,
    Seek = 8,
    Truncate = 9,
    Pread = 10,
    Read = 11,
    Load = 12,
    Stat = 13,
    Fstat = 14,
    Send = 15,
    Access = 16,
    Opendir = 17,
    Readdir = 18,
    Closedir = 19,
    SendPages = 20,
    Page = 21,
}

impl Op {
    /// Every operation in code order
    pub const ALL: [Op; 22] = [
        Op::Open,
        Op::Close,
        Op::Write,
        Op::Rename,
        Op::Symlink,
        Op::Unlink,
        Op::Mkdir,
        Op::Chmod,
        Op::Seek,
        Op::Truncate,
        Op::Pread,
        Op::Read,
        Op::Load,
        Op::Stat,
        Op::Fstat,
        Op::Send,
        Op::Access,
        Op::Opendir,
        Op::Readdir,
        Op::Closedir,
        Op::SendPages,
        Op::Page,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Open => "OPEN",
            Op::Close => "CLOSE",
            Op::Write => "WRITE",
            Op::Rename => "RENAME",
            Op::Symlink => "SYMLINK",
            Op::Unlink => "UNLINK",
            Op::Mkdir => "MKDIR",
            Op::Chmod => "CHMOD",
            Op::Seek => "SEEK",
            Op::Truncate => "TRUNCATE",
            Op::Pread => "PREAD",
            Op::Read => "READ",
            Op::Load => "LOAD",
            Op::Stat => "STAT",
            Op::Fstat => "FSTAT",
            Op::Send => "SEND",
            Op::Access => "ACCESS",
            Op::Opendir => "OPENDIR",
            Op::Readdir => "READDIR",
            Op::Closedir => "CLOSEDIR",
            Op::SendPages => "SEND_PAGES",
            Op::Page => "PAGE",
        }
    }

    /// Operations whose request addresses an executor handle
    pub fn takes_handle(self) -> bool {
        matches!(
            self,
            Op::Close
                | Op::Write
                | Op::Seek
                | Op::Truncate
                | Op::Pread
                | Op::Read
                | Op::Fstat
                | Op::Readdir
                | Op::Closedir
                | Op::SendPages
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Op {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Op::ALL
            .get(value as usize)
            .copied()
            .ok_or(FrameError::UnknownOperation(value))
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    op: Op,
    handle: u8,
    size: u32,
    arg: u32,
}

impl Header {
    /// Build a header, rejecting values that do not fit their bit fields.
    pub fn new(op: Op, handle: u8, size: usize, arg: u32) -> std::result::Result<Self, FrameError> {
        if handle as u32 > HANDLE_MASK {
            return Err(FrameError::HandleOverflow(handle));
        }
        if size > MAX_PAYLOAD {
            return Err(FrameError::PayloadOverflow(size));
        }
        Ok(Self {
            op,
            handle,
            size: size as u32,
            arg,
        })
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    /// Payload length following the header
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn arg(&self) -> u32 {
        self.arg
    }

    /// `arg` read as a response status (negative = failure)
    pub fn status(&self) -> i32 {
        self.arg as i32
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let word = ((self.op.code() as u32 & OP_MASK) << OP_SHIFT)
            | ((self.handle as u32 & HANDLE_MASK) << HANDLE_SHIFT)
            | ((self.size & SIZE_MASK) << SIZE_SHIFT);
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&word.to_le_bytes());
        buf[4..8].copy_from_slice(&self.arg.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> std::result::Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let word = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let arg = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let op = Op::try_from(((word >> OP_SHIFT) & OP_MASK) as u8)?;
        Ok(Self {
            op,
            handle: ((word >> HANDLE_SHIFT) & HANDLE_MASK) as u8,
            size: (word >> SIZE_SHIFT) & SIZE_MASK,
            arg,
        })
    }
}

/// Encode a header and its payload into one buffer.
pub fn encode(header: &Header, payload: &[u8]) -> std::result::Result<Vec<u8>, FrameError> {
    if payload.len() != header.size() {
        return Err(FrameError::MalformedPayload {
            op: header.op(),
            reason: format!(
                "header declares {} bytes, payload has {}",
                header.size(),
                payload.len()
            ),
        });
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame from the front of `bytes`.
pub fn decode(bytes: &[u8]) -> std::result::Result<(Header, &[u8]), FrameError> {
    let header = Header::decode(bytes)?;
    let end = HEADER_SIZE + header.size();
    if bytes.len() < end {
        return Err(FrameError::TooShort {
            expected: end,
            actual: bytes.len(),
        });
    }
    Ok((header, &bytes[HEADER_SIZE..end]))
}

/// Read one header from a stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte; ending anywhere inside the header is a communication error.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Header>> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(FioError::Communication(format!(
                    "end of data after {} of {} header bytes",
                    filled, HEADER_SIZE
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(channel_error(e)),
        }
    }
    Ok(Some(Header::decode(&buf)?))
}

/// Read exactly `size` payload bytes.
pub fn read_payload<R: Read + ?Sized>(reader: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).map_err(channel_error)?;
    Ok(buf)
}

/// Write one frame; the payload length becomes the header's size field.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    op: Op,
    handle: u8,
    arg: u32,
    payload: &[u8],
) -> Result<()> {
    let header = Header::new(op, handle, payload.len(), arg)?;
    writer.write_all(&header.encode()).map_err(channel_error)?;
    writer.write_all(payload).map_err(channel_error)?;
    Ok(())
}

// Payload helpers

#[cfg(unix)]
pub(crate) fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
pub(crate) fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
pub(crate) fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
pub(crate) fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Two paths separated by a NUL byte (RENAME, SYMLINK)
pub(crate) fn path_pair_to_bytes(first: &Path, second: &Path) -> Vec<u8> {
    let mut buf = path_to_bytes(first);
    buf.push(0);
    buf.extend_from_slice(&path_to_bytes(second));
    buf
}

pub(crate) fn path_pair_from_bytes(op: Op, bytes: &[u8]) -> Result<(PathBuf, PathBuf)> {
    let split = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| FrameError::MalformedPayload {
            op,
            reason: "missing path separator".to_string(),
        })?;
    Ok((
        path_from_bytes(&bytes[..split]),
        path_from_bytes(&bytes[split + 1..]),
    ))
}

pub(crate) fn u64_from_payload(op: Op, payload: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FrameError::MalformedPayload {
            op,
            reason: format!("expected 8 bytes, got {}", payload.len()),
        })?;
    Ok(u64::from_le_bytes(raw))
}
