//! Suspending transports.
//!
//! [`ChannelTransport`] listens on a Unix socket whose path is handed to the
//! worker through [`CHANNEL_ENV`]; the worker connects back and speaks the
//! same line protocol as over pipes. [`StreamTransport`] wraps an already
//! connected reader/writer pair.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AsyncConnection, AsyncTransport, TransportError, decode_line};

/// Environment variable carrying the socket path to the worker.
pub const CHANNEL_ENV: &str = "BENCHHOST_CHANNEL";

/// A listening socket waiting for one worker to connect.
///
/// The socket file is removed when the transport is dropped, which happens
/// as soon as the connection has been accepted.
#[cfg(unix)]
#[derive(Debug)]
pub struct ChannelTransport {
    listener: tokio::net::UnixListener,
    path: PathBuf,
    connect_timeout: Duration,
}

#[cfg(unix)]
impl ChannelTransport {
    /// Listen at `path`. Must be called from within a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let path = path.into();
        let listener = tokio::net::UnixListener::bind(&path).map_err(|e| {
            TransportError::Misconfigured(format!("cannot listen on {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "channel listening");
        Ok(Self {
            listener,
            path,
            connect_timeout,
        })
    }

    /// Listen at a fresh, uniquely named path in the temp directory.
    pub fn bind_temp(connect_timeout: Duration) -> Result<Self, TransportError> {
        // Socket paths are length-limited; keep the name short.
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("benchhost-{}.sock", &id[..12]);
        Self::bind(std::env::temp_dir().join(name), connect_timeout)
    }

    /// The value to export to the worker as [`CHANNEL_ENV`].
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove channel socket");
            }
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl AsyncTransport for ChannelTransport {
    type Connection =
        StreamConnection<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf>;

    async fn accept(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError> {
        let accepted = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            accepted = tokio::time::timeout(self.connect_timeout, self.listener.accept()) => accepted,
        };
        let (stream, _) = accepted.map_err(|_| TransportError::TimedOut(self.connect_timeout))??;
        debug!(path = %self.path.display(), "worker connected");
        let (reader, writer) = stream.into_split();
        Ok(StreamConnection::new(reader, writer))
    }
}

/// A connected reader/writer pair, e.g. the halves of a socket or a
/// `tokio::io::duplex` in tests.
#[derive(Debug)]
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait]
impl<R, W> AsyncTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Connection = StreamConnection<R, W>;

    async fn accept(self, cancel: &CancellationToken) -> Result<Self::Connection, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        Ok(StreamConnection::new(self.reader, self.writer))
    }
}

#[derive(Debug)]
pub struct StreamConnection<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R: AsyncRead, W> StreamConnection<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

#[async_trait]
impl<R, W> AsyncConnection for StreamConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, TransportError> {
        let mut bytes = Vec::new();
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            read = self.reader.read_until(b'\n', &mut bytes) => read?,
        };
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(decode_line(bytes)))
    }

    async fn write_line(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        let writer = &mut self.writer;
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            written = async {
                writer.write_all(framed.as_bytes()).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(())
            } => written.map_err(TransportError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn stream_connection_reads_and_writes_lines() {
        let (mut worker_out, host_in) = duplex(1024);
        let (host_out, mut worker_in) = duplex(1024);
        let cancel = CancellationToken::new();

        let mut conn = StreamTransport::new(host_in, host_out)
            .accept(&cancel)
            .await
            .unwrap();

        worker_out.write_all(b"// AfterAll\r\n").await.unwrap();
        assert_eq!(
            conn.read_line(&cancel).await.unwrap().as_deref(),
            Some("// AfterAll")
        );

        conn.write_line("Acknowledgment", &cancel).await.unwrap();
        let mut buf = [0u8; 15];
        worker_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Acknowledgment\n");

        drop(worker_out);
        assert_eq!(conn.read_line(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pending_read_observes_cancellation() {
        let (_worker_out, host_in) = duplex(64);
        let (host_out, _worker_in) = duplex(64);
        let cancel = CancellationToken::new();
        let mut conn = StreamConnection::new(host_in, host_out);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), conn.read_line(&cancel))
            .await
            .expect("read should unwind on cancel");
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn channel_accepts_a_connecting_worker() {
        let transport = ChannelTransport::bind_temp(Duration::from_secs(5)).unwrap();
        let path = transport.path().to_path_buf();
        assert!(path.exists());

        let worker = tokio::spawn(async move {
            let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer.write_all(b"// BeforeAnythingElse\n").await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            lines.next_line().await.unwrap()
        });

        let cancel = CancellationToken::new();
        let mut conn = transport.accept(&cancel).await.unwrap();
        assert_eq!(
            conn.read_line(&cancel).await.unwrap().as_deref(),
            Some("// BeforeAnythingElse")
        );
        conn.write_line("Acknowledgment", &cancel).await.unwrap();
        assert_eq!(worker.await.unwrap().as_deref(), Some("Acknowledgment"));
    }

    #[tokio::test]
    async fn channel_accept_times_out() {
        let transport = ChannelTransport::bind_temp(Duration::from_millis(30)).unwrap();
        let path = transport.path().to_path_buf();
        let result = transport.accept(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::TimedOut(_))));
        assert!(!path.exists(), "socket file should be removed");
    }

    #[tokio::test]
    async fn channel_accept_observes_cancellation() {
        let transport = ChannelTransport::bind_temp(Duration::from_secs(30)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = transport.accept(&cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
