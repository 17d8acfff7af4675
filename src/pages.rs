//! Page transfer engine.
//!
//! Streams the blocks of a relation segment in ascending order, verifying
//! each page, dropping pages the destination does not need, and compressing
//! the rest into length-prefixed records:
//!
//! ```text
//! [block: u32 LE][stored_len: u32 LE][stored_len bytes]
//! ```
//!
//! `stored_len == block_size` means the block is stored raw. The engine runs
//! wherever the source file lives: for a remote handle the agent executes it
//! and the records travel back as PAGE frames.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::Connection;
use crate::compress::Compression;
use crate::error::{FioError, Result};
use crate::file::FioFile;
use crate::fio::exchange;
use crate::frame::Op;
use crate::native;
use crate::protocol::{status, BLOCK_SIZE, MAX_PAYLOAD, PAGE_READ_ATTEMPTS};
use crate::stat::encode_record;

/// Bytes in front of every record's data
pub const RECORD_HEADER_SIZE: usize = 8;

/// Which examined blocks are left out of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SkipPolicy {
    /// All-zero pages only
    ZeroFilled,
    /// Pages whose LSN is older than the horizon
    BelowHorizon,
    #[default]
    ZeroOrBelowHorizon,
}

impl SkipPolicy {
    pub fn skips(self, zero_filled: bool, lsn: Option<u64>, horizon: u64) -> bool {
        let old = lsn.is_some_and(|lsn| lsn < horizon);
        match self {
            SkipPolicy::ZeroFilled => zero_filled,
            SkipPolicy::BelowHorizon => old,
            SkipPolicy::ZeroOrBelowHorizon => zero_filled || old,
        }
    }
}

/// Parameters of one SEND_PAGES transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Blocks to examine, starting at block 0 of the file
    pub nblocks: u32,
    /// Absolute number of the file's first block (segment offset)
    pub segment_block: u32,
    /// Page LSN below which a block is unchanged
    pub horizon: u64,
    pub block_size: u32,
    pub verify_checksums: bool,
    pub compression: Compression,
    pub skip_policy: SkipPolicy,
    /// Reads of an invalid block before reporting a mismatch
    pub read_attempts: u8,
}

impl PageRequest {
    pub fn new(nblocks: u32) -> Self {
        Self {
            nblocks,
            segment_block: 0,
            horizon: 0,
            block_size: BLOCK_SIZE as u32,
            verify_checksums: true,
            compression: Compression::none(),
            skip_policy: SkipPolicy::default(),
            read_attempts: PAGE_READ_ATTEMPTS,
        }
    }

    /// Request covering a file of `size` bytes; a trailing partial block counts.
    pub fn for_file_size(size: u64, block_size: u32) -> Self {
        let bs = u64::from(block_size.max(1));
        let nblocks = size.div_ceil(bs).min(u64::from(u32::MAX)) as u32;
        Self {
            block_size,
            ..Self::new(nblocks)
        }
    }

    pub fn with_horizon(mut self, horizon: u64) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    pub fn with_segment_block(mut self, segment_block: u32) -> Self {
        self.segment_block = segment_block;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let bs = self.block_size as usize;
        if bs == 0 || !bs.is_power_of_two() || bs + RECORD_HEADER_SIZE > MAX_PAYLOAD {
            return Err(invalid_request(format!("unusable block size {}", bs)));
        }
        if self.read_attempts == 0 {
            return Err(invalid_request("read attempts must be at least 1".to_string()));
        }
        // The end frame reports the examined count as a non-negative status
        if self.nblocks > i32::MAX as u32 {
            return Err(invalid_request(format!("{} blocks in one request", self.nblocks)));
        }
        Ok(())
    }
}

fn invalid_request(reason: String) -> FioError {
    FioError::Io(io::Error::new(io::ErrorKind::InvalidInput, reason))
}

/// Outcome of a transfer. `blocks_skipped == blocks_examined - blocks_sent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTransfer {
    pub blocks_examined: u32,
    pub blocks_sent: u32,
    pub blocks_skipped: u32,
    pub bytes_written: u64,
    /// The file ended before `nblocks` blocks were examined
    pub truncated: bool,
}

/// Page layout knowledge the engine needs: where the LSN is and whether the
/// embedded checksum matches.
pub trait PageVerifier: Send + Sync {
    fn page_lsn(&self, page: &[u8]) -> Option<u64>;

    /// `block` is the absolute block number.
    fn verify(&self, page: &[u8], block: u32) -> bool;
}

/// Built-in layout: LSN in bytes 0..8, checksum in bytes 8..12, both LE.
///
/// The checksum is the first four bytes of BLAKE3 over the block number
/// followed by the page with its checksum field zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPage;

impl StandardPage {
    const LSN: std::ops::Range<usize> = 0..8;
    const CHECKSUM: std::ops::Range<usize> = 8..12;

    pub fn page_checksum(page: &[u8], block: u32) -> u32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&block.to_le_bytes());
        hasher.update(&page[..Self::CHECKSUM.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(&page[Self::CHECKSUM.end..]);
        let digest = hasher.finalize();
        let mut word = [0u8; 4];
        word.copy_from_slice(&digest.as_bytes()[..4]);
        u32::from_le_bytes(word)
    }

    pub fn set_lsn(page: &mut [u8], lsn: u64) {
        page[Self::LSN].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Write the checksum for `block` into the page.
    pub fn stamp(page: &mut [u8], block: u32) {
        let sum = Self::page_checksum(page, block);
        page[Self::CHECKSUM].copy_from_slice(&sum.to_le_bytes());
    }
}

impl PageVerifier for StandardPage {
    fn page_lsn(&self, page: &[u8]) -> Option<u64> {
        let raw = page.get(Self::LSN)?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }

    fn verify(&self, page: &[u8], block: u32) -> bool {
        let Some(stored) = page.get(Self::CHECKSUM) else {
            return false;
        };
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        stored == Self::page_checksum(page, block)
    }
}

fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

enum BlockRead {
    Valid,
    EndOfFile,
}

/// Read one block, re-reading while it is torn or fails verification.
fn read_block(
    file: &File,
    buf: &mut [u8],
    blknum: u32,
    req: &PageRequest,
    verifier: &dyn PageVerifier,
) -> Result<BlockRead> {
    let offset = u64::from(blknum) * u64::from(req.block_size);
    let absolute = req.segment_block.wrapping_add(blknum);
    let mut last_len = 0;
    for attempt in 1..=req.read_attempts {
        let n = native::pread(file, buf, offset)?;
        if n == 0 {
            return Ok(BlockRead::EndOfFile);
        }
        last_len = n;
        if n == buf.len()
            && (is_zero_page(buf) || !req.verify_checksums || verifier.verify(buf, absolute))
        {
            return Ok(BlockRead::Valid);
        }
        debug!(block = absolute, attempt, read = n, "block invalid, re-reading");
    }
    if last_len < buf.len() {
        return Err(FioError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "block {} is {} bytes, expected {}",
                absolute, last_len, req.block_size
            ),
        )));
    }
    Err(FioError::PageChecksumMismatch { block: absolute })
}

/// Run the engine over a native file, handing every encoded record to `emit`.
pub fn stream_pages<F>(
    file: &File,
    req: &PageRequest,
    verifier: &dyn PageVerifier,
    mut emit: F,
) -> Result<PageTransfer>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    req.validate()?;
    let bs = req.block_size as usize;
    let mut page = vec![0u8; bs];
    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + bs);
    let mut stats = PageTransfer::default();

    for blknum in 0..req.nblocks {
        if let BlockRead::EndOfFile = read_block(file, &mut page, blknum, req, verifier)? {
            stats.truncated = true;
            break;
        }
        stats.blocks_examined += 1;

        let zero = is_zero_page(&page);
        if req
            .skip_policy
            .skips(zero, verifier.page_lsn(&page), req.horizon)
        {
            stats.blocks_skipped += 1;
            continue;
        }

        encode_page(&mut record, blknum, &page, &req.compression)?;
        emit(&record)?;
        stats.blocks_sent += 1;
        stats.bytes_written += record.len() as u64;
    }
    Ok(stats)
}

fn encode_page(record: &mut Vec<u8>, blknum: u32, page: &[u8], compression: &Compression) -> Result<()> {
    record.clear();
    record.extend_from_slice(&blknum.to_le_bytes());
    let packed = if compression.is_enabled() {
        match compression.compress(page) {
            Ok(packed) if packed.len() < page.len() => Some(packed),
            Ok(_) => None,
            Err(e) => {
                warn!(block = blknum, error = %e, "compression failed, storing block raw");
                None
            }
        }
    } else {
        None
    };
    let data = packed.as_deref().unwrap_or(page);
    record.extend_from_slice(&(data.len() as u32).to_le_bytes());
    record.extend_from_slice(data);
    Ok(())
}

/// Stream the pages of `input` into `out` with the built-in page layout.
///
/// For a remote `input` the agent reads and filters the pages and this side
/// copies the records to `out`. The connection is held for the whole
/// transfer: when `out` is a file on that same connection its writes are
/// refused, the stream is drained and the write error is returned.
pub fn send_pages<W: Write + ?Sized>(
    input: &mut FioFile,
    out: &mut W,
    req: &PageRequest,
) -> Result<PageTransfer> {
    send_pages_with(input, out, req, &StandardPage)
}

/// `send_pages` with a custom verifier for local sources. A remote agent
/// always uses its own verifier.
pub fn send_pages_with<W: Write + ?Sized>(
    input: &mut FioFile,
    out: &mut W,
    req: &PageRequest,
    verifier: &dyn PageVerifier,
) -> Result<PageTransfer> {
    match input {
        FioFile::Local(file) => stream_pages(file, req, verifier, |record| {
            out.write_all(record).map_err(FioError::from_io)
        }),
        FioFile::Remote(remote) => {
            req.validate()?;
            let payload = encode_record(Op::SendPages, req)?;
            let handle = remote.handle();
            exchange(remote.link(), |conn| {
                conn.send(Op::SendPages, handle, 0, &payload)?;
                receive_pages(conn, out, req)
            })
        }
    }
}

/// Copy PAGE records into `out` until the end frame arrives.
fn receive_pages<W: Write + ?Sized>(
    conn: &mut Connection,
    out: &mut W,
    req: &PageRequest,
) -> Result<PageTransfer> {
    let mut stats = PageTransfer::default();
    let mut out_error: Option<io::Error> = None;
    loop {
        let frame = conn.recv(Op::Page)?;
        let code = frame.header.status();
        // Records carry status 0; a negative status is always the end frame
        if code < 0 {
            return Err(match FioError::from_status(code, frame.header.handle(), Op::SendPages) {
                FioError::PageChecksumMismatch { .. } => FioError::PageChecksumMismatch {
                    block: failing_block(&frame.payload)?,
                },
                other => other,
            });
        }
        if frame.header.size() > 0 {
            if frame.payload.len() < RECORD_HEADER_SIZE {
                return Err(FioError::Protocol(format!(
                    "page record of {} bytes",
                    frame.payload.len()
                )));
            }
            stats.blocks_sent += 1;
            stats.bytes_written += frame.payload.len() as u64;
            // Keep draining after a local write failure so the
            // connection stays in step.
            if out_error.is_none() {
                if let Err(e) = out.write_all(&frame.payload) {
                    out_error = Some(e);
                }
            }
            continue;
        }

        if let Some(e) = out_error {
            return Err(FioError::from_io(e));
        }
        stats.blocks_examined = code as u32;
        if stats.blocks_sent > stats.blocks_examined {
            return Err(FioError::Protocol(format!(
                "{} pages sent but only {} examined",
                stats.blocks_sent, stats.blocks_examined
            )));
        }
        stats.blocks_skipped = stats.blocks_examined - stats.blocks_sent;
        stats.truncated = stats.blocks_examined < req.nblocks;
        return Ok(stats);
    }
}

fn failing_block(payload: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| FioError::Protocol("checksum mismatch without block number".to_string()))?;
    Ok(u32::from_le_bytes(raw))
}

/// Build the end-of-stream PAGE reply for a finished transfer.
pub(crate) fn end_of_stream(result: &Result<PageTransfer>) -> (i32, Vec<u8>) {
    match result {
        Ok(stats) => (stats.blocks_examined as i32, Vec::new()),
        Err(FioError::PageChecksumMismatch { block }) => {
            (status::PAGE_CHECKSUM_MISMATCH, block.to_le_bytes().to_vec())
        }
        Err(e) => (e.to_status(), Vec::new()),
    }
}

/// One decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    /// Block number relative to the start of the file
    pub block: u32,
    pub page: Vec<u8>,
}

/// Decodes a record stream produced by `send_pages`.
pub struct PageRecordReader<R> {
    reader: R,
    compression: Compression,
    block_size: usize,
}

impl<R: Read> PageRecordReader<R> {
    pub fn new(reader: R, compression: Compression, block_size: u32) -> Self {
        Self {
            reader,
            compression,
            block_size: block_size as usize,
        }
    }

    /// Next record, or `None` when the stream ends on a record boundary.
    pub fn next_record(&mut self) -> Result<Option<PageRecord>> {
        let mut head = [0u8; RECORD_HEADER_SIZE];
        let got = native::read_full(&mut self.reader, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_HEADER_SIZE {
            return Err(torn_record(got));
        }
        let block = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let stored = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as usize;
        if stored > self.block_size {
            return Err(FioError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record for block {} claims {} bytes", block, stored),
            )));
        }
        let mut data = vec![0u8; stored];
        let got = native::read_full(&mut self.reader, &mut data)?;
        if got < stored {
            return Err(torn_record(RECORD_HEADER_SIZE + got));
        }
        let page = if stored == self.block_size {
            data
        } else {
            self.compression.decompress(&data, self.block_size)?
        };
        Ok(Some(PageRecord { block, page }))
    }

    /// Write every page at its block offset in `target`; returns the number
    /// of pages written.
    pub fn apply_to<T: Write + Seek + ?Sized>(mut self, target: &mut T) -> Result<u32> {
        let mut written = 0;
        while let Some(rec) = self.next_record()? {
            target.seek(SeekFrom::Start(u64::from(rec.block) * self.block_size as u64))?;
            target.write_all(&rec.page)?;
            written += 1;
        }
        Ok(written)
    }
}

impl<R: Read> Iterator for PageRecordReader<R> {
    type Item = Result<PageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn torn_record(got: usize) -> FioError {
    FioError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("page stream ends inside a record after {} bytes", got),
    ))
}
