//! Transport endpoints and duplex streams
//!
//! The daemon listens on a local endpoint recorded in the lock artifact:
//! `ipc://<path>` for a Unix domain socket, or `tcp://<addr>` for a
//! loopback TCP fallback on platforms without Unix sockets. Everything
//! above this module only sees an [`IpcStream`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::IpcError;

/// Get the default endpoint for the daemon.
/// Uses user-specific paths for security isolation:
/// - XDG_RUNTIME_DIR if available (Linux with systemd)
/// - /tmp/warden-daemon-<uid>.sock as fallback on Unix
/// - loopback TCP on non-Unix platforms
pub fn default_endpoint() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return format!("ipc://{}/warden-daemon.sock", runtime_dir);
    }

    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        format!("ipc:///tmp/warden-daemon-{}.sock", uid)
    }

    #[cfg(not(unix))]
    {
        "tcp://127.0.0.1:48732".to_string()
    }
}

/// A parsed endpoint
#[derive(Debug, Clone, PartialEq)]
enum Endpoint {
    Unix(String),
    Tcp(String),
}

fn parse_endpoint(endpoint: &str) -> Result<Endpoint, IpcError> {
    if let Some(path) = endpoint.strip_prefix("ipc://") {
        if path.is_empty() {
            return Err(IpcError::InvalidEndpoint(endpoint.to_string()));
        }
        return Ok(Endpoint::Unix(path.to_string()));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        if addr.is_empty() {
            return Err(IpcError::InvalidEndpoint(endpoint.to_string()));
        }
        return Ok(Endpoint::Tcp(addr.to_string()));
    }
    Err(IpcError::InvalidEndpoint(endpoint.to_string()))
}

/// A duplex byte stream to or from the daemon
#[derive(Debug)]
pub enum IpcStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for IpcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            IpcStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IpcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            IpcStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_flush(cx),
            IpcStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            IpcStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            IpcStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connect to an endpoint within the given timeout
pub async fn connect(endpoint: &str, timeout: Duration) -> Result<IpcStream, IpcError> {
    let parsed = parse_endpoint(endpoint)?;
    let attempt = async {
        match parsed {
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixStream::connect(path).await.map(IpcStream::Unix),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix endpoints are not available on this platform",
            )),
            Endpoint::Tcp(addr) => TcpStream::connect(addr).await.map(IpcStream::Tcp),
        }
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(IpcError::ConnectionFailed(e.to_string())),
        Err(_) => Err(IpcError::Timeout {
            operation: "connect",
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Listening socket for the daemon side (and in-process mock daemons in
/// tests)
#[derive(Debug)]
pub enum IpcListener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl IpcListener {
    /// Bind to an endpoint, replacing any leftover socket file on Unix
    pub async fn bind(endpoint: &str) -> Result<Self, IpcError> {
        match parse_endpoint(endpoint)? {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if std::path::Path::new(&path).exists() {
                    std::fs::remove_file(&path)?;
                }
                if let Some(parent) = std::path::Path::new(&path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = UnixListener::bind(&path)?;
                // Local-machine-only trust model, but keep strangers out
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
                Ok(IpcListener::Unix(listener))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(IpcError::InvalidEndpoint(endpoint.to_string())),
            Endpoint::Tcp(addr) => Ok(IpcListener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Accept one connection
    pub async fn accept(&self) -> Result<IpcStream, IpcError> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(IpcStream::Unix(stream))
            }
            IpcListener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                Ok(IpcStream::Tcp(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("ipc:///tmp/w.sock").unwrap(),
            Endpoint::Unix("/tmp/w.sock".to_string())
        );
        assert_eq!(
            parse_endpoint("tcp://127.0.0.1:9000").unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".to_string())
        );
        assert!(parse_endpoint("/tmp/w.sock").is_err());
        assert!(parse_endpoint("ipc://").is_err());
    }

    #[test]
    fn test_default_endpoint_is_user_scoped() {
        let ep = default_endpoint();
        assert!(ep.starts_with("ipc://") || ep.starts_with("tcp://"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_and_accept() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("ipc://{}/t.sock", dir.path().display());

        let listener = IpcListener::bind(&endpoint).await.unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let err = connect("tcp://127.0.0.1:1", Duration::from_secs(1)).await;
        assert!(err.is_err());
    }
}
