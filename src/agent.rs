//! Executor side of the protocol.
//!
//! The agent owns the native files and directories named by remote handles.
//! It reads one request, executes it against the local filesystem and writes
//! exactly one response (LOAD and SEND_PAGES stream several frames, the last
//! of which closes the exchange) before reading the next request.
//!
//! Operation failures go back to the caller as negative status words and the
//! loop continues. Channel failures end the loop. Either way every handle
//! still open is released before `run` returns.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::channel::response_op;
use crate::error::{channel_error, FioError, FrameError, Result};
use crate::file::OpenFlags;
use crate::frame::{
    path_from_bytes, path_pair_from_bytes, read_header, read_payload, u64_from_payload,
    write_frame, Header, Op,
};
use crate::handle::HandleTable;
use crate::native;
use crate::pages::{end_of_stream, stream_pages, PageRequest, PageVerifier, StandardPage};
use crate::protocol::{whence, MAX_PAYLOAD};
use crate::stat::{decode_record, encode_record};

/// Resource held in the agent's handle table
#[derive(Debug)]
pub enum Resource {
    File(File),
    Dir(fs::ReadDir),
}

/// What a finished conversation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentSummary {
    pub requests: u64,
    /// Handles still open when the conversation ended
    pub released: usize,
}

#[derive(Debug)]
struct Reply {
    op: Op,
    handle: u8,
    status: i32,
    payload: Vec<u8>,
}

impl Reply {
    fn status(op: Op, handle: u8, status: i32) -> Self {
        Self {
            op,
            handle,
            status,
            payload: Vec::new(),
        }
    }

    fn data(handle: u8, payload: Vec<u8>) -> Self {
        Self {
            op: Op::Send,
            handle,
            status: payload.len() as i32,
            payload,
        }
    }
}

enum State {
    AwaitHeader,
    AwaitPayload(Header),
    Dispatch(Header, Vec<u8>),
    Respond(Reply),
}

pub struct Agent<R, W> {
    reader: R,
    writer: W,
    table: HandleTable<Resource>,
    verifier: Arc<dyn PageVerifier>,
    requests: u64,
}

impl<R: Read, W: Write> Agent<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            table: HandleTable::new(),
            verifier: Arc::new(StandardPage),
            requests: 0,
        }
    }

    /// Page layout used for SEND_PAGES verification and horizon checks.
    pub fn with_verifier(mut self, verifier: Arc<dyn PageVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn open_handles(&self) -> usize {
        self.table.len()
    }

    /// Serve requests until the caller closes its end of the channel.
    pub fn run(&mut self) -> Result<AgentSummary> {
        let outcome = self.serve();
        let released = self.release_all();
        let summary = AgentSummary {
            requests: self.requests,
            released,
        };
        match outcome {
            Ok(()) => {
                debug!(requests = summary.requests, released, "conversation finished");
                Ok(summary)
            }
            Err(e) => {
                warn!(requests = summary.requests, released, error = %e, "conversation aborted");
                Err(e)
            }
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    fn serve(&mut self) -> Result<()> {
        let mut state = State::AwaitHeader;
        loop {
            state = match state {
                State::AwaitHeader => match read_header(&mut self.reader)? {
                    Some(header) => State::AwaitPayload(header),
                    None => return Ok(()),
                },
                State::AwaitPayload(header) => {
                    let payload = read_payload(&mut self.reader, header.size())?;
                    State::Dispatch(header, payload)
                }
                State::Dispatch(header, payload) => {
                    self.requests += 1;
                    debug!(op = %header.op(), handle = header.handle(), arg = header.arg(), size = header.size(), "dispatch");
                    State::Respond(self.dispatch(&header, &payload)?)
                }
                State::Respond(reply) => {
                    write_frame(
                        &mut self.writer,
                        reply.op,
                        reply.handle,
                        reply.status as u32,
                        &reply.payload,
                    )?;
                    self.writer.flush().map_err(channel_error)?;
                    State::AwaitHeader
                }
            };
        }
    }

    fn dispatch(&mut self, header: &Header, payload: &[u8]) -> Result<Reply> {
        let result = match header.op() {
            Op::Load => self.load(header, payload),
            Op::SendPages => self.send_pages(header, payload),
            _ => self.execute(header, payload),
        };
        match result {
            Ok(reply) => Ok(reply),
            Err(e @ FioError::Communication(_)) => Err(e),
            Err(e) => {
                debug!(op = %header.op(), error = %e, "request failed");
                Ok(Reply::status(
                    response_op(header.op()),
                    header.handle(),
                    e.to_status(),
                ))
            }
        }
    }

    fn execute(&mut self, header: &Header, payload: &[u8]) -> Result<Reply> {
        let op = header.op();
        let handle = header.handle();
        let arg = header.arg();
        let done = |status: i32| -> Result<Reply> { Ok(Reply::status(op, handle, status)) };

        match op {
            Op::Open => {
                if payload.len() < 4 {
                    return Err(malformed(op, "missing mode"));
                }
                let mode = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let path = path_from_bytes(&payload[4..]);
                let file = native::open(&path, OpenFlags::from_bits(arg), mode)?;
                let slot = self.table.allocate(Resource::File(file))?;
                debug!(path = %path.display(), handle = slot, "opened");
                Ok(Reply::status(op, slot, slot as i32))
            }
            Op::Close => {
                file_of(&mut self.table, handle)?;
                self.table.release(handle)?;
                done(0)
            }
            Op::Write => {
                let written = write_prefix(file_of(&mut self.table, handle)?, payload)?;
                done(written as i32)
            }
            Op::Read => {
                let file = file_of(&mut self.table, handle)?;
                let mut buf = vec![0u8; (arg as usize).min(MAX_PAYLOAD)];
                let n = native::read_full(file, &mut buf)?;
                buf.truncate(n);
                Ok(Reply::data(handle, buf))
            }
            Op::Pread => {
                let offset = u64_from_payload(op, payload)?;
                let file = file_of(&mut self.table, handle)?;
                let mut buf = vec![0u8; (arg as usize).min(MAX_PAYLOAD)];
                let n = native::pread(file, &mut buf, offset)?;
                buf.truncate(n);
                Ok(Reply::data(handle, buf))
            }
            Op::Seek => {
                let offset = u64_from_payload(op, payload)? as i64;
                let pos = match arg {
                    whence::START if offset >= 0 => SeekFrom::Start(offset as u64),
                    whence::CURRENT => SeekFrom::Current(offset),
                    whence::END => SeekFrom::End(offset),
                    _ => return Err(io::Error::from(io::ErrorKind::InvalidInput).into()),
                };
                let new_pos = file_of(&mut self.table, handle)?.seek(pos)?;
                Ok(Reply {
                    payload: new_pos.to_le_bytes().to_vec(),
                    ..Reply::status(op, handle, 0)
                })
            }
            Op::Truncate => {
                let size = u64_from_payload(op, payload)?;
                file_of(&mut self.table, handle)?.set_len(size)?;
                done(0)
            }
            Op::Fstat => {
                let st = native::fstat(file_of(&mut self.table, handle)?)?;
                Ok(Reply::data(handle, encode_record(op, &st)?))
            }
            Op::Stat => {
                let st = native::stat(&path_from_bytes(payload), arg != 0)?;
                Ok(Reply::data(handle, encode_record(op, &st)?))
            }
            Op::Rename => {
                let (from, to) = path_pair_from_bytes(op, payload)?;
                native::rename(&from, &to)?;
                done(0)
            }
            Op::Symlink => {
                let (target, link) = path_pair_from_bytes(op, payload)?;
                native::symlink(&target, &link)?;
                done(0)
            }
            Op::Unlink => {
                native::unlink(&path_from_bytes(payload))?;
                done(0)
            }
            Op::Mkdir => {
                native::mkdir(&path_from_bytes(payload), arg)?;
                done(0)
            }
            Op::Chmod => {
                native::chmod(&path_from_bytes(payload), arg)?;
                done(0)
            }
            Op::Access => {
                native::access(&path_from_bytes(payload), arg)?;
                done(0)
            }
            Op::Opendir => {
                let dir = fs::read_dir(path_from_bytes(payload))?;
                let slot = self.table.allocate(Resource::Dir(dir))?;
                Ok(Reply::status(op, slot, slot as i32))
            }
            Op::Readdir => {
                let dir = dir_of(&mut self.table, handle)?;
                match native::next_entry(dir)? {
                    Some(entry) => Ok(Reply::data(handle, encode_record(op, &entry)?)),
                    None => Ok(Reply::data(handle, Vec::new())),
                }
            }
            Op::Closedir => {
                dir_of(&mut self.table, handle)?;
                self.table.release(handle)?;
                done(0)
            }
            Op::Send | Op::Page | Op::Load | Op::SendPages => Err(FioError::Protocol(format!(
                "{} is not a request",
                op
            ))),
        }
    }

    /// Whole-file transfer: full chunks go out immediately, the final short
    /// chunk (possibly empty) is the reply.
    fn load(&mut self, header: &Header, payload: &[u8]) -> Result<Reply> {
        let path = path_from_bytes(payload);
        let mut file = File::open(&path)?;
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let n = native::read_full(&mut file, &mut buf)?;
            if n < MAX_PAYLOAD {
                buf.truncate(n);
                return Ok(Reply::data(header.handle(), buf));
            }
            write_frame(&mut self.writer, Op::Send, header.handle(), n as u32, &buf)?;
        }
    }

    fn send_pages(&mut self, header: &Header, payload: &[u8]) -> Result<Reply> {
        let handle = header.handle();
        let req: PageRequest = decode_record(Op::SendPages, payload)?;
        let file = file_of(&mut self.table, handle)?;
        let writer = &mut self.writer;
        let result = stream_pages(file, &req, self.verifier.as_ref(), |record| {
            write_frame(writer, Op::Page, handle, 0, record)
        });
        if let Err(e @ FioError::Communication(_)) = result {
            return Err(e);
        }
        if let Ok(stats) = &result {
            debug!(
                handle,
                examined = stats.blocks_examined,
                sent = stats.blocks_sent,
                skipped = stats.blocks_skipped,
                "pages streamed"
            );
        }
        let (status, payload) = end_of_stream(&result);
        Ok(Reply {
            payload,
            ..Reply::status(Op::Page, handle, status)
        })
    }

    fn release_all(&mut self) -> usize {
        let drained = self.table.drain();
        for (handle, resource) in &drained {
            let kind = match resource {
                Resource::File(_) => "file",
                Resource::Dir(_) => "directory",
            };
            debug!(handle, kind, "releasing handle left open by caller");
        }
        drained.len()
    }
}

fn file_of(table: &mut HandleTable<Resource>, handle: u8) -> Result<&mut File> {
    match table.resolve(handle)? {
        Resource::File(file) => Ok(file),
        Resource::Dir(_) => Err(FioError::InvalidHandle(handle)),
    }
}

fn dir_of(table: &mut HandleTable<Resource>, handle: u8) -> Result<&mut fs::ReadDir> {
    match table.resolve(handle)? {
        Resource::Dir(dir) => Ok(dir),
        Resource::File(_) => Err(FioError::InvalidHandle(handle)),
    }
}

/// Write as much of `buf` as the file takes. A failure after some bytes
/// went out reports that count, as a native `write` does; the caller sees
/// the error on its next write.
fn write_prefix<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if written > 0 => {
                debug!(written, error = %e, "short write");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

fn malformed(op: Op, reason: &str) -> FioError {
    FrameError::MalformedPayload {
        op,
        reason: reason.to_string(),
    }
    .into()
}

/// Serve one conversation over an already connected reader/writer pair.
pub fn communicate<R: Read, W: Write>(reader: R, writer: W) -> Result<AgentSummary> {
    Agent::new(BufReader::new(reader), BufWriter::new(writer)).run()
}

/// Serve the caller on the other end of this process's stdin/stdout.
pub fn communicate_stdio() -> Result<AgentSummary> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    communicate(stdin.lock(), stdout.lock())
}

/// Bind `addr` and serve every accepted connection on its own thread.
pub fn listen(addr: &str, verifier: Arc<dyn PageVerifier>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "agent listening");
    serve(listener, verifier)
}

pub fn serve(listener: TcpListener, verifier: Arc<dyn PageVerifier>) -> anyhow::Result<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let verifier = Arc::clone(&verifier);
                thread::Builder::new()
                    .name("rfio-conn".to_string())
                    .spawn(move || handle_conn(stream, verifier))
                    .context("spawn connection thread")?;
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn handle_conn(stream: TcpStream, verifier: Arc<dyn PageVerifier>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    info!(peer = %peer, "connection accepted");
    let reader = match stream.try_clone() {
        Ok(r) => r,
        Err(e) => {
            error!(peer = %peer, error = %e, "cannot clone connection");
            return;
        }
    };
    let mut agent = Agent::new(BufReader::new(reader), BufWriter::new(stream)).with_verifier(verifier);
    match agent.run() {
        Ok(summary) => info!(
            peer = %peer,
            requests = summary.requests,
            released = summary.released,
            "connection closed"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "connection ended with error"),
    }
}
