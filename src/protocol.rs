//! Shared protocol constants for the rfio framed transport
//!
//! Header layout (8 bytes, every multi-byte integer little-endian):
//!
//! ```text
//! word0 (u32): op (5 bits) | handle (7 bits) << 5 | size (20 bits) << 12
//! word1 (u32): arg
//! ```

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 8;

pub const OP_BITS: u32 = 5;
pub const HANDLE_BITS: u32 = 7;
pub const SIZE_BITS: u32 = 20;

pub const OP_SHIFT: u32 = 0;
pub const HANDLE_SHIFT: u32 = OP_BITS;
pub const SIZE_SHIFT: u32 = OP_BITS + HANDLE_BITS;

pub const OP_MASK: u32 = (1 << OP_BITS) - 1;
pub const HANDLE_MASK: u32 = (1 << HANDLE_BITS) - 1;
pub const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;

/// Largest payload one frame can describe (2^20 - 1 bytes)
pub const MAX_PAYLOAD: usize = SIZE_MASK as usize;

/// Largest value the handle field can carry
pub const MAX_HANDLE_VALUE: u8 = HANDLE_MASK as u8;

/// Live handles an executor holds per connection
pub const FDMAX: usize = 64;

/// Default page size for the page transfer engine
pub const BLOCK_SIZE: usize = 8192;

/// Default number of reads of one page before a checksum mismatch is reported
pub const PAGE_READ_ATTEMPTS: u8 = 2;

/// Permission bits used when a caller does not supply any
pub const DEFAULT_FILE_MODE: u32 = 0o600;
pub const DEFAULT_DIR_MODE: u32 = 0o700;

/// Response status codes carried in the `arg` word.
///
/// Non-negative values are successes; `-errno` carries an OS error; the
/// values below errno range are protocol-level failures.
pub mod status {
    pub const OK: i32 = 0;
    pub const PAGE_CHECKSUM_MISMATCH: i32 = -256;
    pub const OUT_OF_HANDLES: i32 = -257;
    pub const INVALID_HANDLE: i32 = -258;
    pub const UNSUPPORTED_OPERATION: i32 = -259;
}

/// Whence values for SEEK requests
pub mod whence {
    pub const START: u32 = 0;
    pub const CURRENT: u32 = 1;
    pub const END: u32 = 2;
}

/// Mode bits for ACCESS requests (POSIX values)
pub mod access {
    pub const EXISTS: u32 = 0;
    pub const EXECUTE: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const READ: u32 = 4;
}
