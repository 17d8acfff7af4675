//! Error types for rfio.

use std::io;

use thiserror::Error;

use crate::frame::Op;
use crate::protocol::{status, FDMAX};

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, FioError>;

/// Errors surfaced by the dispatcher, the agent and the page engine
#[derive(Debug, Error)]
pub enum FioError {
    /// OS error, produced locally or by the executor on the far side
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Malformed or truncated frame; the connection cannot continue
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Peer answered with something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Executor handle table is full
    #[error("no free remote handles (limit {})", FDMAX)]
    OutOfHandles,

    /// Handle is unknown, released, or refers to the wrong kind of resource
    #[error("invalid remote handle {0}")]
    InvalidHandle(u8),

    /// Page failed checksum verification after every read attempt
    #[error("page checksum mismatch at block {block}")]
    PageChecksumMismatch { block: u32 },

    /// Channel hit end-of-data or failed while a frame was expected
    #[error("communication error: {0}")]
    Communication(String),
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unknown operation code: {0}")]
    UnknownOperation(u8),

    #[error("handle {0} does not fit the 7-bit handle field")]
    HandleOverflow(u8),

    #[error("payload of {0} bytes does not fit the 20-bit size field")]
    PayloadOverflow(usize),

    #[error("malformed {op} payload: {reason}")]
    MalformedPayload { op: Op, reason: String },
}

impl FioError {
    /// Framing and communication failures leave the stream unsynchronized.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FioError::Frame(_) | FioError::Communication(_))
    }

    /// Recover the original error from an `io::Error` built by `From<FioError>`.
    pub fn from_io(err: io::Error) -> Self {
        let kind = err.kind();
        if err.get_ref().is_some_and(|inner| inner.is::<FioError>()) {
            return match err.into_inner().map(|inner| inner.downcast::<FioError>()) {
                Some(Ok(fio)) => *fio,
                Some(Err(other)) => FioError::Io(io::Error::new(kind, other)),
                None => FioError::Io(kind.into()),
            };
        }
        FioError::Io(err)
    }

    /// Status word sent back by the executor for this error.
    pub(crate) fn to_status(&self) -> i32 {
        match self {
            FioError::Io(e) => -errno_of(e),
            FioError::OutOfHandles => status::OUT_OF_HANDLES,
            FioError::InvalidHandle(_) => status::INVALID_HANDLE,
            FioError::PageChecksumMismatch { .. } => status::PAGE_CHECKSUM_MISMATCH,
            FioError::Protocol(_) | FioError::Frame(_) => status::UNSUPPORTED_OPERATION,
            FioError::Communication(_) => -errno_of(&io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Rebuild the caller-side error for a negative status word.
    pub(crate) fn from_status(code: i32, handle: u8, op: Op) -> Self {
        match code {
            status::OUT_OF_HANDLES => FioError::OutOfHandles,
            status::INVALID_HANDLE => FioError::InvalidHandle(handle),
            status::UNSUPPORTED_OPERATION => {
                FioError::Protocol(format!("agent rejected {} request", op))
            }
            status::PAGE_CHECKSUM_MISMATCH => FioError::PageChecksumMismatch { block: 0 },
            code if code < 0 && code > status::PAGE_CHECKSUM_MISMATCH => {
                FioError::Io(io::Error::from_raw_os_error(-code))
            }
            code => FioError::Protocol(format!("unexpected status {} for {}", code, op)),
        }
    }
}

/// Map a channel failure: any I/O error on the transport itself is a
/// communication error, never an OS error of the requested operation.
pub(crate) fn channel_error(err: io::Error) -> FioError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FioError::Communication("end of data".to_string())
    } else {
        FioError::Communication(err.to_string())
    }
}

impl From<FioError> for io::Error {
    fn from(err: FioError) -> Self {
        let kind = match err {
            FioError::Io(e) => return e,
            FioError::Communication(_) => io::ErrorKind::ConnectionAborted,
            FioError::InvalidHandle(_) => io::ErrorKind::InvalidInput,
            FioError::PageChecksumMismatch { .. }
            | FioError::Frame(_)
            | FioError::Protocol(_) => io::ErrorKind::InvalidData,
            FioError::OutOfHandles => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// errno value for an I/O error, synthesized from its kind when the error
/// did not come from the OS.
#[cfg(unix)]
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        io::ErrorKind::Interrupted => libc::EINTR,
        _ => libc::EIO,
    }
}

#[cfg(not(unix))]
pub(crate) fn errno_of(err: &io::Error) -> i32 {
    // EIO
    err.raw_os_error().unwrap_or(5)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip_keeps_os_error() {
        let err = FioError::Io(io::Error::from_raw_os_error(libc::ENOENT));
        let code = err.to_status();
        assert_eq!(code, -libc::ENOENT);
        match FioError::from_status(code, 0, Op::Open) {
            FioError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reserved_statuses_map_to_typed_errors() {
        assert!(matches!(
            FioError::from_status(status::OUT_OF_HANDLES, 0, Op::Open),
            FioError::OutOfHandles
        ));
        assert!(matches!(
            FioError::from_status(status::INVALID_HANDLE, 9, Op::Read),
            FioError::InvalidHandle(9)
        ));
        assert!(matches!(
            FioError::from_status(status::PAGE_CHECKSUM_MISMATCH, 0, Op::SendPages),
            FioError::PageChecksumMismatch { .. }
        ));
    }

    #[test]
    fn io_conversion_is_reversible() {
        let io_err: io::Error = FioError::InvalidHandle(3).into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
        assert!(matches!(FioError::from_io(io_err), FioError::InvalidHandle(3)));

        let native = io::Error::from_raw_os_error(libc::EACCES);
        let io_err: io::Error = FioError::Io(native).into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn synthesized_errno_follows_kind() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(errno_of(&err), libc::ENOENT);
        let err = io::Error::new(io::ErrorKind::Other, "odd");
        assert_eq!(errno_of(&err), libc::EIO);
    }
}
