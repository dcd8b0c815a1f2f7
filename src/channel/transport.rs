//! Byte transports driven by the channel engine.
//!
//! A [`Transport`] is the read/write/shutdown capability of one established
//! connection. Plain TCP ([`TcpTransport`]) and TLS
//! ([`TlsTransport`](super::tls::TlsTransport)) both implement it, and a
//! [`TransportFactory`] turns a freshly connected or accepted socket into one.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
};

use log::trace;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::{Error, config::ChannelConfig, error::ConnectionError};

const LISTEN_BACKLOG: i32 = 128;

/// One established connection.
///
/// Reads and writes may run concurrently from different threads; `read`
/// returning `Ok(0)` means the peer closed the connection.
pub trait Transport: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `buf` and returns its length.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Closes both directions, unblocking pending reads and writes.
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

pub trait TransportFactory: Send + Sync {
    /// Wraps a connected socket, running any negotiation the transport needs.
    fn establish(
        &self,
        stream: TcpStream,
        side: Side,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn Transport>, Error>;
}

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Uses the socket as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainFactory;

impl TransportFactory for PlainFactory {
    fn establish(
        &self,
        stream: TcpStream,
        _side: Side,
        _config: &ChannelConfig,
    ) -> Result<Arc<dyn Transport>, Error> {
        Ok(Arc::new(TcpTransport::new(stream)))
    }
}

/// Applies linger-on-close and keep-alive to an established socket.
pub fn apply_socket_options(stream: &TcpStream, config: &ChannelConfig) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_linger(Some(config.linger()))?;
    socket.set_keepalive(true)?;
    Ok(())
}

/// Connects to `address` within the configured connect timeout.
pub fn connect(address: SocketAddr, config: &ChannelConfig) -> Result<TcpStream, ConnectionError> {
    trace!("connecting to {address}");
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.connect_timeout(&address.into(), config.connect_timeout())?;

    let stream: TcpStream = socket.into();
    apply_socket_options(&stream, config)?;
    Ok(stream)
}

/// Binds a listening socket with address reuse enabled.
pub fn bind(address: SocketAddr) -> Result<TcpListener, ConnectionError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
