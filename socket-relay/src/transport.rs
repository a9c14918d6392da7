use std::{
    fmt,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Socket family used for both listening and dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Unix,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "unix" => Ok(Transport::Unix),
            _ => Err(RelayError::UnknownTransport(s.to_string())),
        }
    }
}

/// Where a host listens or a client dials.
///
/// The address is a `host:port` pair for TCP and a filesystem path for Unix
/// domain sockets. The value is fixed once built; the fields are only
/// readable through accessors.
///
/// Accepted string forms are `tcp://127.0.0.1:5000`, `unix:///run/relay.sock`
/// and a bare path starting with `/` or `.`, which is taken as a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    transport: Transport,
    address: String,
}

impl ConnectionInfo {
    pub fn new(transport: Transport, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(Transport::Tcp, address)
    }

    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::new(
            Transport::Unix,
            path.as_ref().to_string_lossy().into_owned(),
        )
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.address)
    }
}

impl FromStr for ConnectionInfo {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((scheme, address)) = s.split_once("://") {
            let transport = scheme.parse()?;
            if address.is_empty() {
                return Err(RelayError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::new(transport, address));
        }

        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Self::unix(s));
        }

        Err(RelayError::InvalidAddress(s.to_string()))
    }
}

/// A connected byte stream of either socket family.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens outbound connections for a [`Client`](crate::client::Client).
///
/// [`ConnectionInfo`] is the production implementation. Anything that can
/// hand back a readable stream can stand in for it, which is how the
/// reconnect behaviour is exercised without real sockets.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + Unpin + Send + 'static;

    fn dial(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human readable target used in log lines.
    fn label(&self) -> String {
        String::from("dialer")
    }
}

impl Dialer for ConnectionInfo {
    type Stream = Stream;

    async fn dial(&self) -> io::Result<Stream> {
        match self.transport {
            Transport::Tcp => TcpStream::connect(self.address()).await.map(Stream::Tcp),
            #[cfg(unix)]
            Transport::Unix => UnixStream::connect(self.address()).await.map(Stream::Unix),
            #[cfg(not(unix))]
            Transport::Unix => Err(unix_unsupported()),
        }
    }

    fn label(&self) -> String {
        self.to_string()
    }
}

/// Bound listening socket owned by a host's accept loop.
///
/// Dropping a Unix listener removes its socket file.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub(crate) async fn bind(info: &ConnectionInfo) -> Result<Self, RelayError> {
        let result = match info.transport() {
            Transport::Tcp => TcpListener::bind(info.address()).await.map(Listener::Tcp),
            Transport::Unix => Self::bind_unix(Path::new(info.address())),
        };

        result.map_err(|source| RelayError::Bind {
            transport: info.transport(),
            address: info.address().to_string(),
            source,
        })
    }

    #[cfg(unix)]
    fn bind_unix(path: &Path) -> io::Result<Self> {
        remove_stale_socket(path);
        let listener = UnixListener::bind(path)?;
        Ok(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(_path: &Path) -> io::Result<Self> {
        Err(unix_unsupported())
    }

    /// Waits for the next connection and returns it with a label for logs.
    pub(crate) async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), format!("unix:{}", path.display())))
            }
        }
    }

    pub(crate) fn local_info(&self) -> io::Result<ConnectionInfo> {
        match self {
            Listener::Tcp(listener) => Ok(ConnectionInfo::tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(ConnectionInfo::unix(path)),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(error) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), ?error, "socket file already gone");
            }
        }
    }
}

/// Removes whatever sits at `path` so a fresh socket can be bound there.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), ?error, "failed to remove stale socket file"),
    }
}

#[cfg(not(unix))]
fn unix_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix domain sockets are not available on this platform",
    )
}
