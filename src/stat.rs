//! Metadata and directory entry records carried by STAT/FSTAT/READDIR.
//!
//! Records are serialized with bincode so both sides agree on one layout
//! regardless of the platform `stat` structure.

use std::ffi::{OsStr, OsString};
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::frame::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl From<fs::FileType> for FileKind {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        }
    }
}

/// Portable subset of `struct stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub kind: FileKind,
    /// Full `st_mode`, including the file type bits on unix
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub dev: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Permission bits only
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

#[cfg(unix)]
impl From<&fs::Metadata> for FileStat {
    fn from(md: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: md.file_type().into(),
            mode: md.mode(),
            size: md.size(),
            mtime: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            ino: md.ino(),
            dev: md.dev(),
        }
    }
}

#[cfg(not(unix))]
impl From<&fs::Metadata> for FileStat {
    fn from(md: &fs::Metadata) -> Self {
        let (mtime, mtime_nsec) = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i64))
            .unwrap_or((0, 0));
        Self {
            kind: md.file_type().into(),
            mode: if md.permissions().readonly() { 0o444 } else { 0o644 },
            size: md.len(),
            mtime,
            mtime_nsec,
            nlink: 1,
            uid: 0,
            gid: 0,
            ino: 0,
            dev: 0,
        }
    }
}

/// One directory entry as returned by READDIR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn file_name(&self) -> &OsStr {
        &self.name
    }
}

pub(crate) fn encode_record<T: Serialize>(op: Op, record: &T) -> Result<Vec<u8>> {
    bincode::serialize(record).map_err(|e| {
        FrameError::MalformedPayload {
            op,
            reason: e.to_string(),
        }
        .into()
    })
}

pub(crate) fn decode_record<T: for<'de> Deserialize<'de>>(op: Op, payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| {
        FrameError::MalformedPayload {
            op,
            reason: e.to_string(),
        }
        .into()
    })
}
