//! Location dispatcher.
//!
//! Every path-taking call names the `Location` of its target. When that
//! location is this process (or no agent is connected) the native call runs
//! here; otherwise the call becomes one request on the shared connection and
//! the response is mapped back into the result a local call would give.

use std::cell::RefCell;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::channel::{Connection, Response};
use crate::dir::{FioDir, RemoteDir};
use crate::error::{FioError, Result};
use crate::file::{FioFile, OpenFlags, RemoteFile};
use crate::frame::{path_pair_to_bytes, path_to_bytes, Op};
use crate::location::Location;
use crate::native;
use crate::protocol::{access, DEFAULT_FILE_MODE, MAX_HANDLE_VALUE, MAX_PAYLOAD};
use crate::stat::{decode_record, FileStat};

/// Connection shared by a context and every remote file or directory it
/// opened. One exchange is in flight at a time: other threads wait for it,
/// a nested exchange on the same thread fails (see `exchange`).
pub(crate) type Link = Arc<ReentrantMutex<RefCell<Connection>>>;

/// Run `f` with exclusive use of the connection.
///
/// Starting an exchange while this thread is already inside one, such as
/// writing page records into a file on the connection that streams them,
/// is refused instead of deadlocking.
pub(crate) fn exchange<T>(link: &Link, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let guard = link.lock();
    let mut conn = guard
        .try_borrow_mut()
        .map_err(|_| FioError::Protocol("connection busy with another exchange".to_string()))?;
    f(&mut conn)
}

/// Execution context: which location this process is, and the agent
/// connection used for every other location.
#[derive(Clone, Default)]
pub struct Fio {
    here: Location,
    link: Option<Link>,
}

impl std::fmt::Debug for Fio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fio")
            .field("here", &self.here)
            .field("connected", &self.link.is_some())
            .finish()
    }
}

impl Fio {
    /// Context with no agent: every location executes locally.
    pub fn new(here: Location) -> Self {
        Self { here, link: None }
    }

    pub fn connected(here: Location, conn: Connection) -> Self {
        Self {
            here,
            link: Some(Arc::new(ReentrantMutex::new(RefCell::new(conn)))),
        }
    }

    pub fn here(&self) -> Location {
        self.here
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// True when calls for `loc` go over the connection.
    pub fn is_remote(&self, loc: Location) -> bool {
        loc != Location::Local && loc != self.here && self.link.is_some()
    }

    pub(crate) fn remote(&self, loc: Location) -> Option<&Link> {
        if self.is_remote(loc) {
            self.link.as_ref()
        } else {
            None
        }
    }

    /// Open with the default creation mode (0600).
    pub fn open(&self, path: impl AsRef<Path>, flags: OpenFlags, loc: Location) -> Result<FioFile> {
        self.open_with_mode(path, flags, DEFAULT_FILE_MODE, loc)
    }

    pub fn open_with_mode(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
        loc: Location,
    ) -> Result<FioFile> {
        let path = path.as_ref();
        let Some(link) = self.remote(loc) else {
            return Ok(FioFile::Local(native::open(path, flags, mode)?));
        };
        let mut payload = mode.to_le_bytes().to_vec();
        payload.extend_from_slice(&path_to_bytes(path));
        let resp = call(link, Op::Open, flags.bits(), &payload)?;
        let handle = handle_from_status(Op::Open, &resp)?;
        debug!(path = %path.display(), handle, %loc, "opened remote file");
        Ok(FioFile::Remote(RemoteFile::new(Arc::clone(link), handle)))
    }

    /// Open using an `fopen` mode string such as "r", "w+" or "ab".
    pub fn fopen(&self, path: impl AsRef<Path>, mode: &str, loc: Location) -> Result<FioFile> {
        self.open(path, OpenFlags::from_mode(mode)?, loc)
    }

    pub fn stat(&self, path: impl AsRef<Path>, follow_symlinks: bool, loc: Location) -> Result<FileStat> {
        let path = path.as_ref();
        match self.remote(loc) {
            None => Ok(native::stat(path, follow_symlinks)?),
            Some(link) => {
                let resp = call(link, Op::Stat, follow_symlinks as u32, &path_to_bytes(path))?;
                decode_record(Op::Stat, &resp.payload)
            }
        }
    }

    pub fn rename(&self, old_path: impl AsRef<Path>, new_path: impl AsRef<Path>, loc: Location) -> Result<()> {
        let (old_path, new_path) = (old_path.as_ref(), new_path.as_ref());
        match self.remote(loc) {
            None => Ok(native::rename(old_path, new_path)?),
            Some(link) => {
                call(link, Op::Rename, 0, &path_pair_to_bytes(old_path, new_path))?;
                Ok(())
            }
        }
    }

    /// Create `link_path` pointing at `target`.
    pub fn symlink(&self, target: impl AsRef<Path>, link_path: impl AsRef<Path>, loc: Location) -> Result<()> {
        let (target, link_path) = (target.as_ref(), link_path.as_ref());
        match self.remote(loc) {
            None => Ok(native::symlink(target, link_path)?),
            Some(link) => {
                call(link, Op::Symlink, 0, &path_pair_to_bytes(target, link_path))?;
                Ok(())
            }
        }
    }

    pub fn unlink(&self, path: impl AsRef<Path>, loc: Location) -> Result<()> {
        let path = path.as_ref();
        match self.remote(loc) {
            None => Ok(native::unlink(path)?),
            Some(link) => {
                call(link, Op::Unlink, 0, &path_to_bytes(path))?;
                Ok(())
            }
        }
    }

    /// Create a directory and its missing parents.
    pub fn mkdir(&self, path: impl AsRef<Path>, mode: u32, loc: Location) -> Result<()> {
        let path = path.as_ref();
        match self.remote(loc) {
            None => Ok(native::mkdir(path, mode)?),
            Some(link) => {
                call(link, Op::Mkdir, mode, &path_to_bytes(path))?;
                Ok(())
            }
        }
    }

    pub fn chmod(&self, path: impl AsRef<Path>, mode: u32, loc: Location) -> Result<()> {
        let path = path.as_ref();
        match self.remote(loc) {
            None => Ok(native::chmod(path, mode)?),
            Some(link) => {
                call(link, Op::Chmod, mode, &path_to_bytes(path))?;
                Ok(())
            }
        }
    }

    /// Check accessibility; `mode` combines the `protocol::access` bits.
    pub fn access(&self, path: impl AsRef<Path>, mode: u32, loc: Location) -> Result<()> {
        let path = path.as_ref();
        match self.remote(loc) {
            None => Ok(native::access(path, mode)?),
            Some(link) => {
                call(link, Op::Access, mode, &path_to_bytes(path))?;
                Ok(())
            }
        }
    }

    /// `access` with only the existence bit; a missing path is `Ok(false)`.
    pub fn exists(&self, path: impl AsRef<Path>, loc: Location) -> Result<bool> {
        match self.access(path, access::EXISTS, loc) {
            Ok(()) => Ok(true),
            Err(FioError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn opendir(&self, path: impl AsRef<Path>, loc: Location) -> Result<FioDir> {
        let path = path.as_ref();
        let Some(link) = self.remote(loc) else {
            return Ok(FioDir::Local(fs::read_dir(path)?));
        };
        let resp = call(link, Op::Opendir, 0, &path_to_bytes(path))?;
        let handle = handle_from_status(Op::Opendir, &resp)?;
        debug!(path = %path.display(), handle, %loc, "opened remote directory");
        Ok(FioDir::Remote(RemoteDir::new(Arc::clone(link), handle)))
    }

    /// Read a whole file into memory. Remotely the agent streams it back in
    /// maximum-size chunks; a short chunk ends the transfer.
    pub fn load(&self, path: impl AsRef<Path>, loc: Location) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let Some(link) = self.remote(loc) else {
            return Ok(fs::read(path)?);
        };
        let data = exchange(link, |conn| {
            let mut data = Vec::new();
            let mut resp = conn.call(Op::Load, 0, 0, &path_to_bytes(path))?;
            loop {
                let chunk = resp.check(Op::Load)?;
                let last = chunk.payload.len() < MAX_PAYLOAD;
                data.extend_from_slice(&chunk.payload);
                if last {
                    return Ok(data);
                }
                resp = conn.recv(Op::Send)?;
            }
        })?;
        debug!(path = %path.display(), bytes = data.len(), %loc, "loaded file");
        Ok(data)
    }

    /// Whole file as an in-memory reader.
    pub fn open_stream(&self, path: impl AsRef<Path>, loc: Location) -> Result<Cursor<Vec<u8>>> {
        self.load(path, loc).map(Cursor::new)
    }
}

fn call(link: &Link, op: Op, arg: u32, payload: &[u8]) -> Result<Response> {
    exchange(link, |conn| conn.call(op, 0, arg, payload)?.check(op))
}

fn handle_from_status(op: Op, resp: &Response) -> Result<u8> {
    let status = resp.header.status();
    if status > MAX_HANDLE_VALUE as i32 {
        return Err(FioError::Protocol(format!(
            "{} returned out-of-range handle {}",
            op, status
        )));
    }
    Ok(status as u8)
}
