//! Line transports between the host and a worker.
//!
//! The broker only ever needs "read the next line" and "write one line", so
//! every transport reduces to a [`Connection`] (blocking, used on the
//! caller's thread) or an [`AsyncConnection`] (suspending, used from a tokio
//! task). A transport is consumed by `attach`/`accept`, which yields the
//! connection for exactly one session.
//!
//! | Transport            | Mode  | Wire                                    |
//! |----------------------|-------|-----------------------------------------|
//! | [`PipeTransport`]    | sync  | worker stdout (lines) / stdin (acks)    |
//! | [`ChannelTransport`] | async | Unix socket the worker connects back to |
//! | [`StreamTransport`]  | async | any `AsyncRead` + `AsyncWrite` pair     |
//! | [`MemoryTransport`]  | both  | scripted lines, recorded writes         |

pub mod channel;
pub mod memory;
#[cfg(unix)]
pub mod pipe;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
pub use channel::ChannelTransport;
pub use channel::{CHANNEL_ENV, StreamConnection, StreamTransport};
pub use memory::{MemoryConnection, MemoryTransport, WrittenLines};
#[cfg(unix)]
pub use pipe::{PipeConnection, PipeTransport};

/// Transport-level failures.
///
/// Everything except [`TransportError::Misconfigured`] is consistent with the
/// worker having gone away and is classified, not propagated, by the broker.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("worker disconnected: {0}")]
    Disconnected(#[source] io::Error),

    #[error("worker did not connect within {0:?}")]
    TimedOut(Duration),

    #[error("transport misconfigured: {0}")]
    Misconfigured(String),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, TransportError::Misconfigured(_))
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => TransportError::Disconnected(e),
            _ => TransportError::Io(e),
        }
    }
}

/// Something a blocking connection can be obtained from.
pub trait Transport {
    type Connection: Connection;

    /// Attach to the worker. Fails with `Cancelled` if `cancel` already fired.
    fn attach(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError>;
}

/// A blocking, line-oriented, bidirectional connection.
pub trait Connection {
    /// Next line without its terminator, or `None` once the stream ended.
    fn read_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>, TransportError>;

    /// Write `line` followed by a newline and flush.
    fn write_line(&mut self, line: &str, cancel: &CancellationToken) -> Result<(), TransportError>;
}

/// Something a suspending connection can be accepted from.
#[async_trait]
pub trait AsyncTransport: Send {
    type Connection: AsyncConnection;

    /// Wait for the worker's connection, bounded by `cancel`.
    async fn accept(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError>;
}

/// A suspending, line-oriented, bidirectional connection.
///
/// Taking `&mut self` keeps at most one read in flight per session.
#[async_trait]
pub trait AsyncConnection: Send {
    async fn read_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, TransportError>;

    async fn write_line(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;
}

/// Decode raw line bytes, dropping a trailing `\n` or `\r\n`.
pub(crate) fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_terminators() {
        assert_eq!(decode_line(b"42\n".to_vec()), "42");
        assert_eq!(decode_line(b"42\r\n".to_vec()), "42");
        assert_eq!(decode_line(b"no newline".to_vec()), "no newline");
        assert_eq!(decode_line(b"\n".to_vec()), "");
        assert_eq!(decode_line(b"a\rb\n".to_vec()), "a\rb");
    }

    #[test]
    fn decode_is_lossy_on_invalid_utf8() {
        assert_eq!(decode_line(vec![b'o', b'k', 0xff, b'\n']), "ok\u{fffd}");
    }

    #[test]
    fn io_errors_are_classified() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            TransportError::from(reset),
            TransportError::Disconnected(_)
        ));
        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(matches!(TransportError::from(pipe), TransportError::Disconnected(_)));
        let other = io::Error::other("disk on fire");
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }

    #[test]
    fn only_misconfigured_is_a_programming_error() {
        assert!(TransportError::Misconfigured("x".into()).is_misconfiguration());
        assert!(!TransportError::Cancelled.is_misconfiguration());
        assert!(!TransportError::TimedOut(Duration::from_secs(1)).is_misconfiguration());
    }
}
