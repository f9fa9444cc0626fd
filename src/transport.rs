//! Byte streams the session runs over.
//!
//! The session only needs blocking writes, blocking reads and a zero-timeout
//! readiness check, expressed with the [`embedded_io`] traits. A
//! [`Connector`] opens such a stream for a host and port; TLS is layered on by
//! supplying a connector that wraps its own stream.

use std::{
    io::{self, Read as _, Write as _},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write};
use log::debug;

/// Stream the session reads packets from and writes packets to.
pub trait Transport: Read + Write + ReadReady + Send + 'static {}

impl<T> Transport for T where T: Read + Write + ReadReady + Send + 'static {}

/// Opens a fresh [`Transport`] for every connection attempt.
pub trait Connector: Send + 'static {
    type Transport: Transport;

    fn connect(&mut self, host: &str, port: u16) -> Result<Self::Transport, crate::Error>;
}

/// Plain TCP connector.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn connect(&mut self, host: &str, port: u16) -> Result<Self::Transport, crate::Error> {
        let mut last_err = None;

        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(self.nodelay)?;
                    debug!("tcp stream open to {addr}");

                    return Ok(TcpTransport { stream });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))
            .into())
    }
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct TransportError(#[from] io::Error);

impl embedded_io::Error for TransportError {
    fn kind(&self) -> ErrorKind {
        match self.0.kind() {
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            io::ErrorKind::InvalidData => ErrorKind::InvalidData,
            io::ErrorKind::WriteZero => ErrorKind::WriteZero,
            _ => ErrorKind::Other,
        }
    }
}

/// [`TcpStream`] exposed through the [`embedded_io`] traits.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl ErrorType for TcpTransport {
    type Error = TransportError;
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        Ok(self.stream.read(buf)?)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        Ok(self.stream.write(buf)?)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(self.stream.flush()?)
    }
}

impl ReadReady for TcpTransport {
    /// Readable data or a closed peer both count as ready so the next read
    /// reports the closure.
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        self.stream.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let peeked = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false)?;

        match peeked {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Maps a stream error into the crate error, keeping its kind.
pub(crate) fn stream_error<E: embedded_io::Error>(err: E) -> crate::Error {
    let kind = match err.kind() {
        ErrorKind::ConnectionReset => io::ErrorKind::ConnectionReset,
        ErrorKind::ConnectionAborted => io::ErrorKind::ConnectionAborted,
        ErrorKind::NotConnected => io::ErrorKind::NotConnected,
        ErrorKind::BrokenPipe => io::ErrorKind::BrokenPipe,
        ErrorKind::TimedOut => io::ErrorKind::TimedOut,
        ErrorKind::Interrupted => io::ErrorKind::Interrupted,
        ErrorKind::InvalidData => io::ErrorKind::InvalidData,
        _ => io::ErrorKind::Other,
    };

    crate::Error::Io(io::Error::new(kind, format!("{err:?}")))
}
