//! Caller side of a connection: one duplex byte stream to an agent.
//!
//! Requests are strictly sequential. `call` writes one frame, flushes, and
//! blocks for the response; there is no request id because responses can
//! only arrive in request order. Once a framing or communication failure is
//! seen the connection refuses every later request.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::error::{FioError, Result};
use crate::frame::{read_header, read_payload, write_frame, Header, Op};

type Input = Box<dyn Read + Send>;
type Output = Box<dyn Write + Send>;

/// Response frame as received from the agent
#[derive(Debug)]
pub(crate) struct Response {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Response {
    /// Turn a negative status into the matching error.
    pub fn check(self, request: Op) -> Result<Self> {
        let code = self.header.status();
        if code >= 0 {
            return Ok(self);
        }
        Err(FioError::from_status(code, self.header.handle(), request))
    }
}

pub struct Connection {
    reader: BufReader<Input>,
    writer: BufWriter<Output>,
    peer: String,
    broken: Option<String>,
    child: Option<Child>,
}

impl Connection {
    /// Wrap two already connected byte channels.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::named(reader, writer, "stream")
    }

    pub fn named<R, W>(reader: R, writer: W, peer: &str) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: BufReader::new(Box::new(reader)),
            writer: BufWriter::new(Box::new(writer)),
            peer: peer.to_string(),
            broken: None,
            child: None,
        }
    }

    /// Connect to an agent listening on TCP.
    pub fn tcp(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr, error = %e, "set_nodelay failed");
        }
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());
        let reader = stream.try_clone().context("clone tcp stream")?;
        info!(peer = %peer, "connected to agent");
        Ok(Self::named(reader, stream, &peer))
    }

    /// Spawn an agent process (typically `ssh host rfio-agent`) and talk to
    /// it over its stdin/stdout. The child's stderr is inherited.
    pub fn spawn(command: &mut Command) -> anyhow::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn agent {:?}", command))?;
        let stdin = child.stdin.take().context("agent stdin unavailable")?;
        let stdout = child.stdout.take().context("agent stdout unavailable")?;
        let peer = format!("pid {}", child.id());
        info!(peer = %peer, "spawned agent");
        let mut conn = Self::named(stdout, stdin, &peer);
        conn.child = Some(child);
        Ok(conn)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// True once a fatal failure has been seen
    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Send one request and wait for its response frame.
    pub(crate) fn call(&mut self, op: Op, handle: u8, arg: u32, payload: &[u8]) -> Result<Response> {
        self.send(op, handle, arg, payload)?;
        let expect = response_op(op);
        self.recv(expect)
    }

    pub(crate) fn send(&mut self, op: Op, handle: u8, arg: u32, payload: &[u8]) -> Result<()> {
        self.ensure_usable()?;
        debug!(%op, handle, arg, size = payload.len(), "request");
        let sent = write_frame(&mut self.writer, op, handle, arg, payload).and_then(|()| {
            self.writer
                .flush()
                .map_err(crate::error::channel_error)
        });
        self.poison_on_fatal(sent)
    }

    /// Read the next frame and require it to carry `expect`.
    pub(crate) fn recv(&mut self, expect: Op) -> Result<Response> {
        self.ensure_usable()?;
        let received = self.read_frame().and_then(|resp| {
            if resp.header.op() != expect {
                return Err(FioError::Protocol(format!(
                    "expected {} response, got {}",
                    expect,
                    resp.header.op()
                )));
            }
            Ok(resp)
        });
        self.poison_on_fatal(received)
    }

    fn read_frame(&mut self) -> Result<Response> {
        let header = read_header(&mut self.reader)?.ok_or_else(|| {
            FioError::Communication("end of data: agent closed the connection".to_string())
        })?;
        let payload = read_payload(&mut self.reader, header.size())?;
        debug!(op = %header.op(), handle = header.handle(), status = header.status(), size = header.size(), "response");
        Ok(Response { header, payload })
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.broken {
            Some(reason) => Err(FioError::Communication(format!(
                "connection to {} is unusable after earlier failure: {}",
                self.peer, reason
            ))),
            None => Ok(()),
        }
    }

    fn poison_on_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            // A response with the wrong op leaves the stream out of step too
            if e.is_fatal() || matches!(e, FioError::Protocol(_)) {
                warn!(peer = %self.peer, error = %e, "connection marked unusable");
                self.broken = Some(e.to_string());
            }
        }
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            debug!(peer = %self.peer, error = %e, "flush on close failed");
        }
        // Closing our end is the agent's signal to release its handles
        self.writer = BufWriter::new(Box::new(io::sink()));
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if status.success() => debug!(peer = %self.peer, "agent exited"),
                Ok(status) => warn!(peer = %self.peer, %status, "agent exited with failure"),
                Err(e) => warn!(peer = %self.peer, error = %e, "failed to reap agent"),
            }
        }
    }
}

/// Op code the agent uses when answering `request`.
pub(crate) fn response_op(request: Op) -> Op {
    match request {
        Op::Read | Op::Pread | Op::Load | Op::Stat | Op::Fstat | Op::Readdir => Op::Send,
        Op::SendPages => Op::Page,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn data_responses_use_send() {
        assert_eq!(response_op(Op::Read), Op::Send);
        assert_eq!(response_op(Op::Readdir), Op::Send);
        assert_eq!(response_op(Op::SendPages), Op::Page);
        assert_eq!(response_op(Op::Open), Op::Open);
        assert_eq!(response_op(Op::Closedir), Op::Closedir);
    }

    #[test]
    fn eof_poisons_connection() {
        let mut conn = Connection::new(Cursor::new(Vec::new()), io::sink());
        let err = conn.call(Op::Unlink, 0, 0, b"/tmp/x").unwrap_err();
        assert!(matches!(err, FioError::Communication(_)));
        assert!(conn.is_broken());
        let err = conn.call(Op::Unlink, 0, 0, b"/tmp/x").unwrap_err();
        assert!(matches!(err, FioError::Communication(_)));
    }

    #[test]
    fn wrong_response_op_is_a_violation() {
        let mut canned = Vec::new();
        write_frame(&mut canned, Op::Mkdir, 0, 0, &[]).unwrap();
        let mut conn = Connection::new(Cursor::new(canned), io::sink());
        let err = conn.call(Op::Unlink, 0, 0, b"/tmp/x").unwrap_err();
        assert!(matches!(err, FioError::Protocol(_)));
        assert!(conn.is_broken());
    }

    #[test]
    fn negative_status_is_not_fatal() {
        let mut canned = Vec::new();
        write_frame(&mut canned, Op::Unlink, 0, (-2i32) as u32, &[]).unwrap();
        let mut conn = Connection::new(Cursor::new(canned), io::sink());
        let resp = conn.call(Op::Unlink, 0, 0, b"/tmp/x").unwrap();
        assert!(resp.check(Op::Unlink).is_err());
        assert!(!conn.is_broken());
    }
}
