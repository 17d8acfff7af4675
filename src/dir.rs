//! Directory streams for either side of the connection.

use std::fs::ReadDir;

use tracing::warn;

use crate::error::{FioError, Result};
use crate::fio::{exchange, Link};
use crate::frame::Op;
use crate::native;
use crate::stat::{decode_record, DirEntry};

/// An open directory stream. Entries come back in the order the OS yields
/// them, without "." and "..".
#[derive(Debug)]
pub enum FioDir {
    Local(ReadDir),
    Remote(RemoteDir),
}

impl FioDir {
    /// Next entry, or `None` at the end of the directory.
    pub fn readdir(&mut self) -> Result<Option<DirEntry>> {
        match self {
            FioDir::Local(dir) => Ok(native::next_entry(dir)?),
            FioDir::Remote(dir) => dir.readdir(),
        }
    }

    pub fn closedir(self) -> Result<()> {
        match self {
            FioDir::Local(_) => Ok(()),
            FioDir::Remote(mut dir) => dir.closedir(),
        }
    }

    /// Executor handle of a remote stream
    pub fn handle(&self) -> Option<u8> {
        match self {
            FioDir::Local(_) => None,
            FioDir::Remote(dir) => Some(dir.handle),
        }
    }
}

impl Iterator for FioDir {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.readdir().transpose()
    }
}

pub struct RemoteDir {
    link: Link,
    handle: u8,
    open: bool,
}

impl std::fmt::Debug for RemoteDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDir")
            .field("handle", &self.handle)
            .field("open", &self.open)
            .finish()
    }
}

impl RemoteDir {
    pub(crate) fn new(link: Link, handle: u8) -> Self {
        Self {
            link,
            handle,
            open: true,
        }
    }

    /// An empty SEND payload marks the end of the directory.
    fn readdir(&mut self) -> Result<Option<DirEntry>> {
        if !self.open {
            return Err(FioError::InvalidHandle(self.handle));
        }
        let handle = self.handle;
        let resp = exchange(&self.link, |conn| {
            conn.call(Op::Readdir, handle, 0, &[])?.check(Op::Readdir)
        })?;
        if resp.payload.is_empty() {
            return Ok(None);
        }
        decode_record(Op::Readdir, &resp.payload).map(Some)
    }

    fn closedir(&mut self) -> Result<()> {
        if !self.open {
            return Err(FioError::InvalidHandle(self.handle));
        }
        let handle = self.handle;
        exchange(&self.link, |conn| {
            conn.call(Op::Closedir, handle, 0, &[])?.check(Op::Closedir)
        })?;
        self.open = false;
        Ok(())
    }
}

impl Drop for RemoteDir {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.closedir() {
            warn!(handle = self.handle, error = %e, "failed to close remote directory on drop");
        }
    }
}
