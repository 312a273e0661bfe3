//! Blocking transport: TCP, TLS over TCP, or a Unix domain socket.

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

#[cfg(feature = "tls")]
use native_tls::TlsStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::opts::Opts;

/// How long `close` keeps draining after the half-close.
const DRAIN_DEADLINE: Duration = Duration::from_millis(10);
/// Read timeout while draining.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(3);

pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
    Closed,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stream::Tcp(_) => "Stream::Tcp",
            #[cfg(feature = "tls")]
            Stream::Tls(_) => "Stream::Tls",
            Stream::Unix(_) => "Stream::Unix",
            Stream::Closed => "Stream::Closed",
        })
    }
}

fn closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed")
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    /// Open the socket described by `opts`.
    pub fn connect(opts: &Opts) -> Result<Self> {
        let stream = match &opts.socket {
            Some(path) => {
                let unix = UnixStream::connect(path).map_err(|e| {
                    Error::connection(format!("Socket fail to connect to {path}"), Some(e.into()))
                })?;
                Stream::unix(unix)
            }
            None => {
                if opts.host.is_empty() {
                    return Err(Error::InvalidUsage("host is empty".into()));
                }
                Stream::tcp(connect_tcp(&opts.host, opts.port, opts.connect_timeout)?)
            }
        };
        stream.set_timeouts(opts.socket_timeout)?;
        debug!(target = %opts.target(), "socket connected");
        Ok(stream)
    }

    pub fn is_tls(&self) -> bool {
        match self {
            #[cfg(feature = "tls")]
            Stream::Tls(_) => true,
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Stream::Closed)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.read_exact(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.read_exact(buf),
            Stream::Unix(r) => r.read_exact(buf),
            Stream::Closed => Err(closed()),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().write_all(buf),
            Stream::Unix(r) => r.get_mut().write_all(buf),
            Stream::Closed => Err(closed()),
        }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().flush(),
            Stream::Unix(r) => r.get_mut().flush(),
            Stream::Closed => Err(closed()),
        }
    }

    /// Apply the socket read/write timeout.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Stream::Tcp(r) => {
                r.get_ref().set_read_timeout(timeout)?;
                r.get_ref().set_write_timeout(timeout)?;
            }
            #[cfg(feature = "tls")]
            Stream::Tls(r) => {
                r.get_ref().get_ref().set_read_timeout(timeout)?;
                r.get_ref().get_ref().set_write_timeout(timeout)?;
            }
            Stream::Unix(r) => {
                r.get_ref().set_read_timeout(timeout)?;
                r.get_ref().set_write_timeout(timeout)?;
            }
            Stream::Closed => {}
        }
        Ok(())
    }

    /// Handle that can shut the socket down from another thread.
    pub fn killer(&self) -> Option<SocketKiller> {
        match self {
            Stream::Tcp(r) => r.get_ref().try_clone().ok().map(SocketKiller::Tcp),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_ref().get_ref().try_clone().ok().map(SocketKiller::Tcp),
            Stream::Unix(r) => r.get_ref().try_clone().ok().map(SocketKiller::Unix),
            Stream::Closed => None,
        }
    }

    /// Upgrade a plain TCP stream to TLS. Only valid before authentication.
    #[cfg(feature = "tls")]
    pub fn upgrade_to_tls(self, opts: &Opts) -> Result<Self> {
        let reader = match self {
            Stream::Tcp(reader) => reader,
            Stream::Tls(_) => return Err(Error::InvalidUsage("TLS is already active".into())),
            Stream::Unix(_) | Stream::Closed => {
                return Err(Error::InvalidUsage(
                    "TLS upgrade needs a TCP connection".into(),
                ));
            }
        };
        if !reader.buffer().is_empty() {
            return Err(Error::Protocol(
                "unexpected data received before the TLS handshake".into(),
            ));
        }
        let tcp = reader.into_inner();
        let connector = tls_connector(opts)?;
        let tls = connector.connect(&opts.host, tcp).map_err(|e| match e {
            native_tls::HandshakeError::Failure(e) => {
                Error::connection("TLS handshake failed", Some(Error::Tls(e)))
            }
            native_tls::HandshakeError::WouldBlock(_) => {
                Error::connection("TLS handshake interrupted", None)
            }
        })?;
        debug!(host = %opts.host, "TLS established");
        Ok(Stream::Tls(BufReader::new(tls)))
    }

    #[cfg(not(feature = "tls"))]
    pub fn upgrade_to_tls(self, _opts: &Opts) -> Result<Self> {
        Err(Error::Unsupported(
            "TLS requested but the tls feature is not enabled".into(),
        ))
    }

    /// Half-close, drain briefly, then close. Safe to call more than once.
    pub fn close(&mut self) {
        match std::mem::replace(self, Stream::Closed) {
            Stream::Tcp(reader) => graceful_shutdown(reader.into_inner()),
            #[cfg(feature = "tls")]
            Stream::Tls(reader) => {
                let mut tls = reader.into_inner();
                let _ = tls.shutdown();
                if let Ok(tcp) = tls.get_ref().try_clone() {
                    graceful_shutdown(tcp);
                }
            }
            Stream::Unix(reader) => graceful_shutdown(reader.into_inner()),
            Stream::Closed => {}
        }
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs = (host, port).to_socket_addrs().map_err(|e| {
        Error::connection(format!("Socket fail to connect to {host}:{port}"), Some(e.into()))
    })?;
    let mut last_error = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(tcp) => {
                tcp.set_nodelay(true)?;
                return Ok(tcp);
            }
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(Error::connection(
        format!("Socket fail to connect to {host}:{port}"),
        last_error.map(Error::from),
    ))
}

#[cfg(feature = "tls")]
fn tls_connector(opts: &Opts) -> Result<native_tls::TlsConnector> {
    use crate::opts::SslMode;

    let mut builder = native_tls::TlsConnector::builder();
    match opts.ssl_mode {
        SslMode::Disable | SslMode::Prefer | SslMode::Require => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyFull => {}
    }
    if let Some(path) = &opts.tls_ca_cert {
        let pem = std::fs::read(path)?;
        builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

/// Sockets that support the half-close + drain sequence.
trait Shutdownable: Read {
    fn shutdown_socket(&self, how: Shutdown) -> std::io::Result<()>;
    fn set_read_deadline(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl Shutdownable for TcpStream {
    fn shutdown_socket(&self, how: Shutdown) -> std::io::Result<()> {
        self.shutdown(how)
    }

    fn set_read_deadline(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

impl Shutdownable for UnixStream {
    fn shutdown_socket(&self, how: Shutdown) -> std::io::Result<()> {
        self.shutdown(how)
    }

    fn set_read_deadline(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)
    }
}

fn graceful_shutdown<S: Shutdownable>(mut socket: S) {
    if socket.shutdown_socket(Shutdown::Write).is_ok()
        && socket.set_read_deadline(Some(DRAIN_READ_TIMEOUT)).is_ok()
    {
        let start = Instant::now();
        let mut buf = [0_u8; 1024];
        while start.elapsed() < DRAIN_DEADLINE {
            match socket.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
    let _ = socket.shutdown_socket(Shutdown::Both);
}

/// A cloned socket handle used to abort blocking I/O from another thread.
#[derive(Debug)]
pub enum SocketKiller {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl SocketKiller {
    /// Shut the socket down; blocked reads and writes on the original
    /// handle return immediately.
    pub fn kill(&self) {
        let _ = match self {
            SocketKiller::Tcp(tcp) => tcp.shutdown(Shutdown::Both),
            SocketKiller::Unix(unix) => unix.shutdown(Shutdown::Both),
        };
    }
}
