//! Location-transparent file handles.
//!
//! `FioFile` behaves like `std::fs::File` whichever side owns the file: it
//! implements `Read`, `Write` and `Seek`, and adds the positional and
//! metadata calls the backup code needs.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::channel::Response;
use crate::error::{FioError, Result};
use crate::fio::{exchange, Link};
use crate::frame::{u64_from_payload, Op};
use crate::handle::Handle;
use crate::native;
use crate::protocol::{whence, MAX_PAYLOAD};
use crate::stat::{decode_record, FileStat};

/// Open flags carried in the OPEN request's `arg` word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: u32 = 0b0000_0001;
    pub const WRITE: u32 = 0b0000_0010;
    pub const CREATE: u32 = 0b0000_0100;
    pub const TRUNCATE: u32 = 0b0000_1000;
    pub const APPEND: u32 = 0b0001_0000;
    pub const EXCLUSIVE: u32 = 0b0010_0000;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn with(mut self, flag: u32) -> Self {
        self.0 |= flag;
        self
    }

    pub fn read_only() -> Self {
        Self(Self::READ)
    }

    pub fn read_write() -> Self {
        Self(Self::READ | Self::WRITE)
    }

    /// Create or truncate for writing
    pub fn create_truncate() -> Self {
        Self(Self::WRITE | Self::CREATE | Self::TRUNCATE)
    }

    /// Translate an `fopen` mode string ("r", "w+", "ab", "wx", ...).
    pub fn from_mode(mode: &str) -> Result<Self> {
        let mut chars = mode.chars().filter(|&c| c != 'b' && c != 't');
        let mut flags = match chars.next() {
            Some('r') => Self(Self::READ),
            Some('w') => Self::create_truncate(),
            Some('a') => Self(Self::WRITE | Self::APPEND | Self::CREATE),
            _ => return Err(invalid_mode(mode)),
        };
        for c in chars {
            flags = match c {
                '+' => flags.with(Self::READ | Self::WRITE),
                'x' if flags.contains(Self::CREATE) => flags.with(Self::EXCLUSIVE),
                _ => return Err(invalid_mode(mode)),
            };
        }
        Ok(flags)
    }
}

fn invalid_mode(mode: &str) -> FioError {
    FioError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid open mode {:?}", mode),
    ))
}

/// An open file, local or owned by the agent on the far side
#[derive(Debug)]
pub enum FioFile {
    Local(File),
    Remote(RemoteFile),
}

impl FioFile {
    pub fn handle(&self) -> Handle {
        match self {
            FioFile::Local(file) => Handle::Local(raw_descriptor(file)),
            FioFile::Remote(remote) => Handle::Remote(remote.handle),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FioFile::Remote(_))
    }

    /// Read at `offset` without moving the file cursor. Fills `buf` unless
    /// end of file comes first.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            FioFile::Local(file) => Ok(native::pread(file, buf, offset)?),
            FioFile::Remote(remote) => remote.pread(buf, offset),
        }
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        match self {
            FioFile::Local(file) => Ok(file.set_len(size)?),
            FioFile::Remote(remote) => remote.truncate(size),
        }
    }

    pub fn fstat(&mut self) -> Result<FileStat> {
        match self {
            FioFile::Local(file) => Ok(native::fstat(file)?),
            FioFile::Remote(remote) => remote.fstat(),
        }
    }

    /// Flush data and metadata to stable storage (`fsync`). The wire
    /// protocol carries no sync request, so a remote file reports
    /// `Unsupported` and the agent's own writes are left to its OS.
    pub fn sync(&mut self) -> Result<()> {
        match self {
            FioFile::Local(file) => Ok(file.sync_all()?),
            FioFile::Remote(remote) => Err(FioError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("sync of remote handle {}", remote.handle),
            ))),
        }
    }

    /// Close the file, reporting any failure of the remote CLOSE.
    pub fn close(self) -> Result<()> {
        match self {
            FioFile::Local(file) => {
                drop(file);
                Ok(())
            }
            FioFile::Remote(mut remote) => remote.close(),
        }
    }
}

impl Read for FioFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FioFile::Local(file) => file.read(buf),
            FioFile::Remote(remote) => Ok(remote.read(buf)?),
        }
    }
}

impl Write for FioFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FioFile::Local(file) => file.write(buf),
            FioFile::Remote(remote) => Ok(remote.write(buf)?),
        }
    }

    /// Remote writes are acknowledged only after the agent's write returns,
    /// so there is nothing buffered on this side.
    fn flush(&mut self) -> io::Result<()> {
        match self {
            FioFile::Local(file) => file.flush(),
            FioFile::Remote(_) => Ok(()),
        }
    }
}

impl Seek for FioFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            FioFile::Local(file) => file.seek(pos),
            FioFile::Remote(remote) => Ok(remote.seek(pos)?),
        }
    }
}

#[cfg(unix)]
fn raw_descriptor(file: &File) -> crate::handle::RawDescriptor {
    use std::os::fd::AsRawFd;
    file.as_raw_fd()
}

#[cfg(windows)]
fn raw_descriptor(file: &File) -> crate::handle::RawDescriptor {
    use std::os::windows::io::AsRawHandle;
    file.as_raw_handle()
}

/// File held open by the agent
pub struct RemoteFile {
    link: Link,
    handle: u8,
    open: bool,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("handle", &self.handle)
            .field("open", &self.open)
            .finish()
    }
}

impl RemoteFile {
    pub(crate) fn new(link: Link, handle: u8) -> Self {
        Self {
            link,
            handle,
            open: true,
        }
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub(crate) fn link(&self) -> &Link {
        &self.link
    }

    fn call(&self, op: Op, arg: u32, payload: &[u8]) -> Result<Response> {
        if !self.open {
            return Err(FioError::InvalidHandle(self.handle));
        }
        exchange(&self.link, |conn| conn.call(op, self.handle, arg, payload)?.check(op))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = buf.len().min(MAX_PAYLOAD);
        let resp = self.call(Op::Read, want as u32, &[])?;
        copy_data(Op::Read, &resp.payload, &mut buf[..want])
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let want = (buf.len() - filled).min(MAX_PAYLOAD);
            let pos = offset + filled as u64;
            let resp = self.call(Op::Pread, want as u32, &pos.to_le_bytes())?;
            let got = copy_data(Op::Pread, &resp.payload, &mut buf[filled..filled + want])?;
            filled += got;
            if got < want {
                break;
            }
        }
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let chunk = &buf[..buf.len().min(MAX_PAYLOAD)];
        let resp = self.call(Op::Write, 0, chunk)?;
        let written = resp.header.status() as usize;
        if written > chunk.len() {
            return Err(FioError::Protocol(format!(
                "agent reports {} bytes written of {}",
                written,
                chunk.len()
            )));
        }
        Ok(written)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (how, offset) = match pos {
            SeekFrom::Start(off) => (whence::START, off as i64),
            SeekFrom::Current(off) => (whence::CURRENT, off),
            SeekFrom::End(off) => (whence::END, off),
        };
        let resp = self.call(Op::Seek, how, &offset.to_le_bytes())?;
        u64_from_payload(Op::Seek, &resp.payload)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.call(Op::Truncate, 0, &size.to_le_bytes())?;
        Ok(())
    }

    fn fstat(&mut self) -> Result<FileStat> {
        let resp = self.call(Op::Fstat, 0, &[])?;
        decode_record(Op::Fstat, &resp.payload)
    }

    fn close(&mut self) -> Result<()> {
        self.call(Op::Close, 0, &[])?;
        self.open = false;
        Ok(())
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.close() {
            warn!(handle = self.handle, error = %e, "failed to close remote file on drop");
        }
    }
}

fn copy_data(op: Op, data: &[u8], buf: &mut [u8]) -> Result<usize> {
    if data.len() > buf.len() {
        return Err(FioError::Protocol(format!(
            "{} returned {} bytes for a {} byte request",
            op,
            data.len(),
            buf.len()
        )));
    }
    buf[..data.len()].copy_from_slice(data);
    Ok(data.len())
}
