//! Scripted transport for replaying recorded worker output.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AsyncConnection, AsyncTransport, Connection, Transport, TransportError};

/// Lines written by the host, shared with whoever built the transport.
#[derive(Debug, Clone, Default)]
pub struct WrittenLines(Arc<Mutex<Vec<String>>>);

impl WrittenLines {
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, line: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_owned());
    }
}

/// Yields a fixed sequence of lines and then ends the stream, or fails with
/// a configured I/O error instead of ending.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    lines: VecDeque<String>,
    written: WrittenLines,
    failure: Option<io::ErrorKind>,
}

impl MemoryTransport {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Split a transcript on newlines. A trailing newline does not produce an
    /// extra empty line.
    pub fn from_transcript(text: &str) -> Self {
        Self::new(text.lines())
    }

    /// Fail the read after the last line with an error of `kind`.
    pub fn then_fail(mut self, kind: io::ErrorKind) -> Self {
        self.failure = Some(kind);
        self
    }

    /// Handle to the lines the host writes once attached.
    pub fn written(&self) -> WrittenLines {
        self.written.clone()
    }
}

impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    fn attach(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(MemoryConnection { transport: self })
    }
}

#[async_trait]
impl AsyncTransport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn accept(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError> {
        self.attach(cancel)
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    transport: MemoryTransport,
}

impl Connection for MemoryConnection {
    fn read_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match self.transport.lines.pop_front() {
            Some(line) => Ok(Some(line)),
            None => match self.transport.failure.take() {
                Some(kind) => Err(io::Error::from(kind).into()),
                None => Ok(None),
            },
        }
    }

    fn write_line(&mut self, line: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.transport.written.push(line);
        Ok(())
    }
}

#[async_trait]
impl AsyncConnection for MemoryConnection {
    async fn read_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, TransportError> {
        Connection::read_line(self, cancel)
    }

    async fn write_line(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        Connection::write_line(self, line, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_then_ends() {
        let transport = MemoryTransport::from_transcript("a\nb\n");
        let written = transport.written();
        let cancel = CancellationToken::new();
        let mut conn = transport.attach(&cancel).unwrap();

        assert_eq!(Connection::read_line(&mut conn, &cancel).unwrap().as_deref(), Some("a"));
        Connection::write_line(&mut conn, "ack", &cancel).unwrap();
        assert_eq!(Connection::read_line(&mut conn, &cancel).unwrap().as_deref(), Some("b"));
        assert_eq!(Connection::read_line(&mut conn, &cancel).unwrap(), None);
        assert_eq!(written.snapshot(), vec!["ack"]);
    }

    #[test]
    fn configured_failure_replaces_end_of_stream() {
        let transport = MemoryTransport::new(["x"]).then_fail(io::ErrorKind::ConnectionReset);
        let cancel = CancellationToken::new();
        let mut conn = transport.attach(&cancel).unwrap();

        Connection::read_line(&mut conn, &cancel).unwrap();
        let err = Connection::read_line(&mut conn, &cancel).unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)));
    }

    #[test]
    fn cancelled_reads_fail() {
        let cancel = CancellationToken::new();
        let mut conn = MemoryTransport::new(["x"]).attach(&cancel).unwrap();
        cancel.cancel();
        assert!(matches!(
            Connection::read_line(&mut conn, &cancel),
            Err(TransportError::Cancelled)
        ));
    }
}
