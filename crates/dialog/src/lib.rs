//! Line-oriented network dialog shared by the protocol clients: plain
//! TCP or TLS, CRLF framing, and an optional per-operation timeout that
//! closes the connection when it fires.

mod tls;

pub use tls::TlsOptions;

use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 65536;

#[derive(Error, Debug)]
pub enum DialogError {
    #[error("connecting to {host}:{port}: {error}")]
    Connect {
        host: String,
        port: u16,
        error: String,
    },
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("network send error: {0}")]
    Send(String),
    #[error("network receive error: {0}")]
    Receive(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("received line is not UTF-8")]
    Utf8,
    #[error("received line is too long")]
    LineTooLong,
    #[error("{0} is not a valid TLS server name")]
    InvalidServerName(String),
    #[error("TLS handshake with {host} failed: {error}")]
    Tls { host: String, error: String },
}

pub type Result<T> = std::result::Result<T, DialogError>;

/// Object-safe alias for the stream types the dialog can own: a plain
/// TCP stream, a TLS stream wrapped around one, or an in-memory duplex
/// used by tests.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}

impl AsyncReadAndWrite for TcpStream {}
impl AsyncReadAndWrite for tokio::io::DuplexStream {}
impl AsyncReadAndWrite for tokio_rustls::client::TlsStream<BoxedAsyncReadAndWrite> {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

/// A connected line dialog. `send` appends CRLF; `receive` strips one
/// trailing CRLF or LF; `receive_raw` keeps the terminator so callers
/// tracking exact octet counts (the IMAP literal reader) can see it.
#[derive(Debug)]
pub struct Dialog {
    stream: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    timeout: Option<Duration>,
    read_buffer: Vec<u8>,
}

impl Dialog {
    /// Resolve and connect. A timeout of `None` means fully blocking
    /// I/O; otherwise every individual operation races the timer and a
    /// fired timer closes the socket.
    pub async fn connect(hostname: &str, port: u16, timeout_ms: Option<Duration>) -> Result<Self> {
        let connect = TcpStream::connect((hostname, port));
        let stream = match timeout_ms {
            Some(duration) => timeout(duration, connect)
                .await
                .map_err(|_| DialogError::TimedOut(duration))?,
            None => connect.await,
        }
        .map_err(|error| DialogError::Connect {
            host: hostname.to_string(),
            port,
            error: format!("{error}"),
        })?;
        // request/response traffic, no need for Nagle
        stream.set_nodelay(true).ok();
        Ok(Self::with_stream(stream, hostname, timeout_ms))
    }

    /// Wrap an already-connected stream. This is the seam protocol
    /// tests use to drive a client against a scripted peer.
    pub fn with_stream<S: AsyncReadAndWrite + 'static>(
        stream: S,
        hostname: &str,
        timeout_ms: Option<Duration>,
    ) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            hostname: hostname.to_string(),
            timeout: timeout_ms,
            read_buffer: Vec::with_capacity(1024),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) {
        self.stream.take();
    }

    /// Send one protocol line; CRLF is appended here.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        tracing::trace!("send->{}: {line}", self.hostname);
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_all(&data).await
    }

    /// Send pre-formatted bytes verbatim, without framing.
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        tracing::trace!("send->{}: {} raw bytes", self.hostname, data.len());
        self.write_all(data).await
    }

    /// Receive one line with the trailing CRLF (or lone LF) removed.
    pub async fn receive(&mut self) -> Result<String> {
        let mut line = self.read_line().await?;
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        tracing::trace!("recv<-{}: {line}", self.hostname);
        Ok(line)
    }

    /// Receive one line keeping the terminator intact.
    pub async fn receive_raw(&mut self) -> Result<String> {
        let line = self.read_line().await?;
        tracing::trace!("recv<-{}: {} raw bytes", self.hostname, line.len());
        Ok(line)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DialogError::NotConnected)?;
        let io = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match self.timeout {
            Some(duration) => match timeout(duration, io).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => {
                    self.stream.take();
                    Err(DialogError::Send(format!("{error}")))
                }
                Err(_) => {
                    self.stream.take();
                    Err(DialogError::TimedOut(duration))
                }
            },
            None => match io.await {
                Ok(()) => Ok(()),
                Err(error) => {
                    self.stream.take();
                    Err(DialogError::Send(format!("{error}")))
                }
            },
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.read_buffer) {
                let line: Vec<u8> = self.read_buffer.drain(0..=pos).collect();
                return String::from_utf8(line).map_err(|_| DialogError::Utf8);
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.stream.take();
                return Err(DialogError::LineTooLong);
            }

            let mut data = [0u8; 4096];
            let stream = self.stream.as_mut().ok_or(DialogError::NotConnected)?;
            let read = stream.read(&mut data);
            let size = match self.timeout {
                Some(duration) => match timeout(duration, read).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(error)) => {
                        self.stream.take();
                        return Err(DialogError::Receive(format!("{error}")));
                    }
                    Err(_) => {
                        self.stream.take();
                        return Err(DialogError::TimedOut(duration));
                    }
                },
                None => match read.await {
                    Ok(size) => size,
                    Err(error) => {
                        self.stream.take();
                        return Err(DialogError::Receive(format!("{error}")));
                    }
                },
            };
            if size == 0 {
                self.stream.take();
                return Err(DialogError::Closed);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    /// Perform the TLS handshake on the existing connection, replacing
    /// the owned socket with the TLS stream in place. Subsequent I/O
    /// goes through TLS.
    pub async fn upgrade_tls(&mut self, options: &TlsOptions) -> Result<()> {
        let connector = options.build_connector();
        let name = options
            .alt_name
            .clone()
            .unwrap_or_else(|| self.hostname.clone());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| DialogError::InvalidServerName(name))?;

        let stream = self.stream.take().ok_or(DialogError::NotConnected)?;
        let handshake = connector.connect(server_name, stream);
        let tls_stream = match self.timeout {
            Some(duration) => match timeout(duration, handshake).await {
                Ok(result) => result,
                Err(_) => return Err(DialogError::TimedOut(duration)),
            },
            None => handshake.await,
        }
        .map_err(|error| DialogError::Tls {
            host: self.hostname.clone(),
            error: format!("{error}"),
        })?;

        tracing::debug!("{}: TLS established", self.hostname);
        self.stream.replace(Box::new(tls_stream));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn send_appends_crlf() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut dialog = Dialog::with_stream(client, "test", None);
        dialog.send("EHLO example.com").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        k9::assert_equal!(&buf[..n], b"EHLO example.com\r\n");
    }

    #[tokio::test]
    async fn receive_strips_terminator() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut dialog = Dialog::with_stream(client, "test", None);
        server.write_all(b"220 ready\r\nnext\nrest").await.unwrap();

        k9::assert_equal!(dialog.receive().await.unwrap(), "220 ready");
        // lone LF is also accepted as a terminator
        k9::assert_equal!(dialog.receive().await.unwrap(), "next");
    }

    #[tokio::test]
    async fn receive_raw_keeps_terminator() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut dialog = Dialog::with_stream(client, "test", None);
        server.write_all(b"literal data\r\nmore\n").await.unwrap();

        k9::assert_equal!(dialog.receive_raw().await.unwrap(), "literal data\r\n");
        k9::assert_equal!(dialog.receive_raw().await.unwrap(), "more\n");
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (client, server) = tokio::io::duplex(1024);
        let mut dialog = Dialog::with_stream(client, "test", None);
        drop(server);
        assert!(matches!(
            dialog.receive().await.unwrap_err(),
            DialogError::Closed
        ));
        assert!(!dialog.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_closes_the_socket() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut dialog = Dialog::with_stream(client, "test", Some(Duration::from_millis(250)));
        let err = dialog.receive().await.unwrap_err();
        assert!(matches!(err, DialogError::TimedOut(_)));
        assert!(!dialog.is_connected());

        // the connection is unusable afterwards
        assert!(matches!(
            dialog.send("NOOP").await.unwrap_err(),
            DialogError::NotConnected
        ));
    }

    #[tokio::test]
    async fn split_reads_assemble_one_line() {
        let (client, mut server) = tokio::io::duplex(16);
        let mut dialog = Dialog::with_stream(client, "test", None);
        let writer = tokio::spawn(async move {
            server.write_all(b"+OK a fairly lo").await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(b"ng greeting\r\n").await.unwrap();
            server
        });
        k9::assert_equal!(dialog.receive().await.unwrap(), "+OK a fairly long greeting");
        writer.await.unwrap();
    }
}
