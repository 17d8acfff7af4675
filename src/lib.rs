//! rfio: location-transparent file I/O.
//!
//! A backup tool works against the local filesystem, a database server's
//! data directory and a backup repository through one blocking file API.
//! Calls aimed at a location other than the current process travel as
//! compact binary requests over one duplex connection to an agent, which
//! executes them natively and streams the results back.

pub mod agent;
pub mod channel;
pub mod cli;
pub mod compress;
pub mod config;
pub mod dir;
pub mod error;
pub mod file;
pub mod fio;
pub mod frame;
pub mod gz;
pub mod handle;
pub mod location;
pub mod log;
pub mod logger;
mod native;
pub mod pages;
pub mod protocol;
pub mod stat;

pub use agent::{communicate, communicate_stdio, Agent, AgentSummary};
pub use channel::Connection;
pub use compress::{CompressAlg, Compression};
pub use dir::FioDir;
pub use error::{FioError, FrameError, Result};
pub use file::{FioFile, OpenFlags};
pub use fio::Fio;
pub use frame::{Header, Op};
pub use gz::GzFile;
pub use handle::{Handle, HandleTable};
pub use location::Location;
pub use pages::{
    send_pages, send_pages_with, stream_pages, PageRecord, PageRecordReader, PageRequest,
    PageTransfer, PageVerifier, SkipPolicy, StandardPage,
};
pub use stat::{DirEntry, FileKind, FileStat};
