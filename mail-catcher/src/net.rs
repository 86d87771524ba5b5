//! Connection plumbing shared by the SMTP and POP3 servers

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Longest command line accepted before the rest is treated as a new line
pub const MAX_COMMAND_LINE: u64 = 4096;

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A client connection, plain or upgraded to TLS.
pub enum Connection<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Only observable if a TLS handshake failed; every I/O call errors
    Upgrading,
}

fn upgrading_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection lost during TLS upgrade")
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Connection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Connection::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Connection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Connection::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Connection::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Connection::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

/// Line-oriented reader/writer with an idle deadline on every operation.
///
/// A read or write that does not complete within the deadline fails with
/// [`io::ErrorKind::TimedOut`].
pub struct LineStream<S> {
    stream: BufReader<Connection<S>>,
    idle: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineStream<S> {
    pub fn new(stream: S, idle: Duration) -> Self {
        Self {
            stream: BufReader::new(Connection::Plain(stream)),
            idle,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream.get_ref(), Connection::Tls(_))
    }

    /// Reads up to and including the next `\n`, at most `limit` bytes.
    ///
    /// Returns 0 at end of stream.
    pub async fn read_raw_line(&mut self, buf: &mut Vec<u8>, limit: u64) -> io::Result<usize> {
        let mut limited = (&mut self.stream).take(limit);
        deadline(self.idle, limited.read_until(b'\n', buf)).await
    }

    /// Reads one command line without its line ending. `None` at end of stream.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        if self.read_raw_line(&mut buf, MAX_COMMAND_LINE).await? == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Writes `line` followed by CRLF and flushes.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        debug!("<< {}", line);
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.write_all(&out).await
    }

    /// Writes raw bytes and flushes.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = &mut self.stream;
        deadline(self.idle, async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    /// Performs the server side of a TLS handshake on the plain connection.
    ///
    /// Anything the client sent ahead of the handshake is discarded.
    pub async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let placeholder = BufReader::new(Connection::Upgrading);
        let plain = match std::mem::replace(&mut self.stream, placeholder).into_inner() {
            Connection::Plain(stream) => stream,
            other => {
                self.stream = BufReader::new(other);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "connection is not in plaintext",
                ));
            }
        };
        let tls = deadline(self.idle, acceptor.accept(plain)).await?;
        self.stream = BufReader::new(Connection::Tls(Box::new(tls)));
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        deadline(self.idle, self.stream.shutdown()).await
    }
}

async fn deadline<T, F>(idle: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(idle, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
    }
}

/// Capped exponential backoff for failing `accept` calls.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    pub fn reset(&mut self) {
        self.delay = None;
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.delay {
            None => BACKOFF_START,
            Some(delay) => (delay * 2).min(BACKOFF_MAX),
        };
        self.delay = Some(next);
        next
    }
}

/// Accepts connections until `cancel` fires, spawning `handle` for each on
/// `tracker`. Accept errors are retried with [`AcceptBackoff`].
pub async fn accept_loop<F, Fut>(
    protocol: &'static str,
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
    mut handle: F,
) where
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = AcceptBackoff::default();
    if let Ok(addr) = listener.local_addr() {
        info!(protocol, %addr, "Listening");
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                backoff.reset();
                debug!(protocol, %peer, "Connection accepted");
                tracker.spawn(handle(socket, peer));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(protocol, "Accept error: {}; retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(protocol, "Listener closed");
}

/// Binds `addr`, logging a failure.
pub async fn bind(protocol: &'static str, addr: &str) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        error!(protocol, addr, "Failed to bind: {}", e);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_lines_round_trip() {
        let (server, client) = duplex(1024);
        let mut server = LineStream::new(server, Duration::from_secs(5));
        let mut client = LineStream::new(client, Duration::from_secs(5));

        client.write_all(b"HELO there\r\nNOOP\n").await.unwrap();
        assert_eq!(server.read_line().await.unwrap().unwrap(), "HELO there");
        assert_eq!(server.read_line().await.unwrap().unwrap(), "NOOP");

        server.send("250 ok").await.unwrap();
        assert_eq!(client.read_line().await.unwrap().unwrap(), "250 ok");

        drop(client);
        assert!(server.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (server, _client) = duplex(64);
        let mut server = LineStream::new(server, Duration::from_millis(20));
        let err = server.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_long_line_is_split() {
        let (server, mut client) = duplex(16 * 1024);
        let mut server = LineStream::new(server, Duration::from_secs(5));
        let long = vec![b'a'; MAX_COMMAND_LINE as usize + 10];
        client.write_all(&long).await.unwrap();
        client.write_all(b"\r\n").await.unwrap();

        let first = server.read_line().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_COMMAND_LINE as usize);
        assert_eq!(server.read_line().await.unwrap().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_tls_upgrade() {
        use crate::security::tls::testing::{localhost, localhost_pair};

        let (tls, connector) = localhost_pair();
        let (server, client) = duplex(16 * 1024);
        let mut server = LineStream::new(server, Duration::from_secs(5));

        let client = tokio::spawn(async move {
            let mut tls = connector.connect(localhost(), client).await.unwrap();
            tls.write_all(b"secret\r\n").await.unwrap();
            tls.flush().await.unwrap();
            let mut reply = [0u8; 4];
            tls.read_exact(&mut reply).await.unwrap();
            reply
        });

        assert!(!server.is_tls());
        server.upgrade(&tls.acceptor()).await.unwrap();
        assert!(server.is_tls());
        assert_eq!(server.read_line().await.unwrap().unwrap(), "secret");
        server.send("ok").await.unwrap();
        assert_eq!(&client.await.unwrap(), b"ok\r\n");
    }
}
