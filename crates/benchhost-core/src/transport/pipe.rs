//! Blocking transport over a worker's standard streams.
//!
//! The worker writes protocol lines to its stdout and reads acknowledgments
//! from its stdin. Reads never block indefinitely: the read end is polled in
//! `poll_interval` slices and the cancellation token is checked before every
//! `read`, so disposing the broker unwinds an outstanding read promptly even
//! when the worker stalls in the middle of a line.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Connection, Transport, TransportError, decode_line};

enum PollResult {
    DataAvailable,
    PipeClosed,
    Timeout,
    Error(std::io::Error),
}

fn wait_for_data(fd: RawFd, timeout: Duration) -> PollResult {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1);

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if result < 0 {
        PollResult::Error(std::io::Error::last_os_error())
    } else if result == 0 {
        PollResult::Timeout
    } else if pollfd.revents & libc::POLLIN != 0 {
        // A closing pipe can still hold unread lines.
        PollResult::DataAvailable
    } else if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        PollResult::PipeClosed
    } else {
        PollResult::Timeout
    }
}

/// Worker stdout/stdin, not yet attached.
#[derive(Debug)]
pub struct PipeTransport<R = ChildStdout, W = ChildStdin> {
    reader: R,
    writer: W,
    poll_interval: Duration,
}

impl<R: Read + AsRawFd, W: Write> PipeTransport<R, W> {
    pub fn new(reader: R, writer: W, poll_interval: Duration) -> Self {
        Self {
            reader,
            writer,
            poll_interval,
        }
    }
}

impl PipeTransport<ChildStdout, ChildStdin> {
    /// Take the piped stdout/stdin of `child`.
    ///
    /// Both streams must have been configured with `Stdio::piped()`.
    pub fn from_child(child: &mut Child, poll_interval: Duration) -> Result<Self, TransportError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Misconfigured("worker stdout is not redirected".to_owned())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Misconfigured("worker stdin is not redirected".to_owned())
        })?;
        Ok(Self::new(stdout, stdin, poll_interval))
    }
}

impl<R: Read + AsRawFd, W: Write> Transport for PipeTransport<R, W> {
    type Connection = PipeConnection<R, W>;

    fn attach(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let fd = self.reader.as_raw_fd();
        Ok(PipeConnection {
            reader: self.reader,
            pending: Vec::new(),
            closed: false,
            fd,
            writer: self.writer,
            poll_interval: self.poll_interval,
        })
    }
}

/// An attached pipe pair.
#[derive(Debug)]
pub struct PipeConnection<R = ChildStdout, W = ChildStdin> {
    reader: R,
    /// Bytes read past the last returned line.
    pending: Vec<u8>,
    closed: bool,
    fd: RawFd,
    writer: W,
    poll_interval: Duration,
}

const READ_CHUNK: usize = 4096;

impl<R: Read, W: Write> PipeConnection<R, W> {
    /// Block until a read will not block, or `cancel` fires.
    fn wait_readable(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match wait_for_data(self.fd, self.poll_interval) {
                // On hang-up the read returns what is left, then zero bytes.
                PollResult::DataAvailable | PollResult::PipeClosed => return Ok(()),
                PollResult::Timeout => continue,
                PollResult::Error(e) if e.kind() == ErrorKind::Interrupted => continue,
                PollResult::Error(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Split the first complete line off `pending`, or everything left once
    /// the pipe has closed.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            return Some(std::mem::replace(&mut self.pending, rest));
        }
        if self.closed && !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }

    /// One non-blocking `read` into `pending`, after the fd reported ready.
    fn fill(&mut self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.wait_readable(cancel)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    trace!(fd = self.fd, "worker stdout closed");
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<R: Read, W: Write> Connection for PipeConnection<R, W> {
    fn read_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>, TransportError> {
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if let Some(bytes) = self.take_line() {
                return Ok(Some(decode_line(bytes)));
            }
            if self.closed {
                return Ok(None);
            }
            self.fill(cancel)?;
        }
    }

    fn write_line(&mut self, line: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
