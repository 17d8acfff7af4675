//! Native filesystem calls shared by the local dispatch path and the agent.
//!
//! Both sides go through these functions so a request executed remotely
//! behaves exactly like the same request executed locally.

use std::fs::{self, File, ReadDir};
use std::io::{self, Read};
use std::path::Path;

use crate::file::OpenFlags;
use crate::stat::{DirEntry, FileStat};

pub(crate) fn open(path: &Path, flags: OpenFlags, mode: u32) -> io::Result<File> {
    let mut opts = fs::OpenOptions::new();
    opts.read(flags.contains(OpenFlags::READ))
        .write(flags.contains(OpenFlags::WRITE))
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNCATE));
    if flags.contains(OpenFlags::EXCLUSIVE) {
        opts.create_new(true);
    } else {
        opts.create(flags.contains(OpenFlags::CREATE));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path)
}

pub(crate) fn stat(path: &Path, follow_symlinks: bool) -> io::Result<FileStat> {
    let md = if follow_symlinks {
        fs::metadata(path)?
    } else {
        fs::symlink_metadata(path)?
    };
    Ok(FileStat::from(&md))
}

pub(crate) fn fstat(file: &File) -> io::Result<FileStat> {
    Ok(FileStat::from(&file.metadata()?))
}

pub(crate) fn rename(old_path: &Path, new_path: &Path) -> io::Result<()> {
    fs::rename(old_path, new_path)
}

#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link_path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

#[cfg(not(unix))]
pub(crate) fn symlink(_target: &Path, _link_path: &Path) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) fn unlink(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// Create a directory and any missing parents; an existing directory is fine.
pub(crate) fn mkdir(path: &Path, mode: u32) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

#[cfg(unix)]
pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)
}

#[cfg(unix)]
pub(crate) fn access(path: &Path, mode: u32) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::access(c_path.as_ptr(), mode as libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn access(path: &Path, mode: u32) -> io::Result<()> {
    let md = fs::metadata(path)?;
    if mode & crate::protocol::access::WRITE != 0 && md.permissions().readonly() {
        return Err(io::ErrorKind::PermissionDenied.into());
    }
    Ok(())
}

/// Read until `buf` is full or end of file, like `fread`.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Positional read that fills `buf` unless end of file comes first.
/// The file cursor is left untouched.
pub(crate) fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match read_at(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

pub(crate) fn next_entry(dir: &mut ReadDir) -> io::Result<Option<DirEntry>> {
    match dir.next() {
        None => Ok(None),
        Some(entry) => {
            let entry = entry?;
            Ok(Some(DirEntry {
                name: entry.file_name(),
                kind: entry.file_type()?.into(),
            }))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pread_leaves_cursor_alone() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"0123456789").unwrap();
        let mut file = File::open(&path).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(pread(&file, &mut buf, 6).unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(pread(&file, &mut buf, 8).unwrap(), 2);
        let mut head = [0u8; 2];
        assert_eq!(read_full(&mut file, &mut head).unwrap(), 2);
        assert_eq!(&head, b"01");
    }

    #[test]
    fn mkdir_is_recursive_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("base/16384/pg_tblspc");
        mkdir(&nested, 0o700).unwrap();
        mkdir(&nested, 0o700).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn access_reports_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = access(&tmp.path().join("absent"), crate::protocol::access::EXISTS).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        access(tmp.path(), crate::protocol::access::READ).unwrap();
    }
}
