//! TLS transport on top of a blocking TCP socket.
//!
//! The rustls session sits behind its own lock while the socket is used
//! without one, so a reader blocked on the socket never holds up a writer.
//! Certificates and trust configuration are provided by the caller through
//! ready-made rustls client/server configurations.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::Mutex;
use rustls::{
    ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection,
    pki_types::ServerName,
};

use crate::{
    Error,
    config::ChannelConfig,
    error::{ConfigurationError, ConnectionError},
};

use super::transport::{Side, Transport, TransportFactory};

const TLS_READ_SIZE: usize = 16 * 1024;
const CLOSE_NOTIFY_WAIT: Duration = Duration::from_millis(100);

pub struct TlsTransport {
    socket: TcpStream,
    session: Mutex<Connection>,
    peer: Option<SocketAddr>,
}

impl TlsTransport {
    /// Runs the handshake on `socket`. If it does not finish within `timeout`
    /// the socket is closed and the negotiation fails with a timeout.
    pub fn negotiate(
        socket: TcpStream,
        session: impl Into<Connection>,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let mut session = session.into();
        let deadline = Instant::now() + timeout;

        while session.is_handshaking() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                force_close(&socket);
                return Err(ConnectionError::TimedOut(io::ErrorKind::TimedOut.into()));
            }
            if let Err(e) = handshake_step(&socket, &mut session, remaining) {
                force_close(&socket);
                return Err(e);
            }
        }
        let mut io = &socket;
        while session.wants_write() {
            session.write_tls(&mut io)?;
        }

        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;

        let peer = socket.peer_addr().ok();
        debug!("tls negotiated with {peer:?}");
        Ok(Self {
            socket,
            session: Mutex::new(session),
            peer,
        })
    }

    pub fn has_peer_certificate(&self) -> bool {
        self.session
            .lock()
            .peer_certificates()
            .is_some_and(|certs| !certs.is_empty())
    }

    fn flush_tls(&self, session: &mut Connection) -> io::Result<()> {
        let mut io = &self.socket;
        while session.wants_write() {
            session.write_tls(&mut io)?;
        }
        Ok(())
    }
}

impl Transport for TlsTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut session = self.session.lock();
                match session.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(e),
                }
            }

            let mut raw = [0; TLS_READ_SIZE];
            let n = (&self.socket).read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }

            let mut session = self.session.lock();
            let mut pending = &raw[..n];
            while !pending.is_empty() {
                session.read_tls(&mut pending)?;
                session
                    .process_new_packets()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            self.flush_tls(&mut session)?;
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut session = self.session.lock();
        let n = session.writer().write(buf)?;
        self.flush_tls(&mut session)?;
        Ok(n)
    }

    /// Sends close_notify unless a writer blocked on the socket holds the
    /// session, then closes the socket, which also releases that writer.
    fn shutdown(&self) -> io::Result<()> {
        if let Some(mut session) = self.session.try_lock_for(CLOSE_NOTIFY_WAIT) {
            session.send_close_notify();
            let flushed = self
                .socket
                .set_write_timeout(Some(CLOSE_NOTIFY_WAIT))
                .and_then(|_| self.flush_tls(&mut session));
            if let Err(e) = flushed {
                debug!("close_notify to {:?} not sent: {e}", self.peer);
            }
        } else {
            debug!("session to {:?} busy, closing without close_notify", self.peer);
        }
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// One round of handshake I/O, with both socket timeouts set to what is left
/// of the negotiation deadline.
fn handshake_step(
    socket: &TcpStream,
    session: &mut Connection,
    remaining: Duration,
) -> Result<(), ConnectionError> {
    socket.set_read_timeout(Some(remaining))?;
    socket.set_write_timeout(Some(remaining))?;

    let mut io = socket;
    while session.wants_write() {
        session.write_tls(&mut io)?;
    }
    if session.is_handshaking() && session.wants_read() {
        if session.read_tls(&mut io)? == 0 {
            return Err(ConnectionError::Reset(io::ErrorKind::UnexpectedEof.into()));
        }
        session.process_new_packets()?;
    }
    Ok(())
}

fn force_close(socket: &TcpStream) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        debug!("closing socket after failed negotiation: {e}");
    }
}

/// Builds [`TlsTransport`]s for either side of a connection.
#[derive(Default)]
pub struct TlsFactory {
    client: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    server: Option<Arc<ServerConfig>>,
    revocation_checking: bool,
}

impl TlsFactory {
    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            client: Some((config, server_name)),
            ..Self::default()
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            ..Self::default()
        }
    }

    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.client = Some((config, server_name));
        self
    }

    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// Declares that the supplied certificate verifiers check revocation.
    /// Channels configured with `check_certificate_revocation` refuse to start
    /// without it.
    pub fn with_revocation_checking(mut self) -> Self {
        self.revocation_checking = true;
        self
    }
}

impl TransportFactory for TlsFactory {
    fn establish(
        &self,
        stream: TcpStream,
        side: Side,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn Transport>, Error> {
        if config.check_certificate_revocation && !self.revocation_checking {
            force_close(&stream);
            return Err(ConfigurationError::MissingProvider("revocation-checking certificate verifier").into());
        }

        let timeout = config.negotiation_timeout();
        let transport = match side {
            Side::Client => {
                let Some((client, name)) = &self.client else {
                    force_close(&stream);
                    return Err(ConfigurationError::MissingProvider("tls client configuration").into());
                };
                let session = ClientConnection::new(Arc::clone(client), name.clone())
                    .map_err(ConnectionError::from)?;
                TlsTransport::negotiate(stream, session, timeout)?
            }
            Side::Server => {
                let Some(server) = &self.server else {
                    force_close(&stream);
                    return Err(ConfigurationError::MissingProvider("tls server configuration").into());
                };
                let session =
                    ServerConnection::new(Arc::clone(server)).map_err(ConnectionError::from)?;
                let transport = TlsTransport::negotiate(stream, session, timeout)?;
                if config.require_client_certificate && !transport.has_peer_certificate() {
                    warn!("rejecting {:?}: no client certificate", transport.peer_addr());
                    let _ = transport.shutdown();
                    return Err(ConnectionError::Rejected("client certificate required".into()).into());
                }
                transport
            }
        };

        Ok(Arc::new(transport))
    }
}
