//! Server side of the channel engine: a continuous accept loop that turns
//! every accepted connection into a child [`Channel`].
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, error, info, log, warn};
use parking_lot::Mutex;

use crate::{
    Error,
    cancel::CancellationToken,
    config::ChannelConfig,
    error::{ConfigurationError, ConnectionError},
    runtime::Runtime,
    space::Context,
};

use super::{
    Channel, Incoming,
    pipeline::{ChannelEvent, Pipeline},
    transport::{self, Side, TransportFactory},
};

/// Builds a fresh pipeline for every accepted connection.
pub type PipelineFactory<P> = Arc<dyn Fn() -> P + Send + Sync>;

struct Shared<P: Pipeline> {
    config: ChannelConfig,
    pipelines: PipelineFactory<P>,
    factory: Arc<dyn TransportFactory>,
    runtime: Runtime,
    context: Arc<Context<Incoming<P>>>,
    children: Mutex<Vec<Channel<P>>>,
}

pub struct Listener<P: Pipeline> {
    shared: Arc<Shared<P>>,
    local: SocketAddr,
    token: CancellationToken,
    accept: Option<JoinHandle<()>>,
}

impl<P: Pipeline> Listener<P> {
    /// Binds `local_address`, registers it in the runtime's directory under
    /// the channel name and starts accepting.
    pub fn bind(
        config: ChannelConfig,
        pipelines: PipelineFactory<P>,
        factory: Arc<dyn TransportFactory>,
        runtime: Runtime,
        context: Arc<Context<Incoming<P>>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let address = config
            .local_address
            .as_deref()
            .ok_or(ConfigurationError::InvalidValue {
                field: "local_address",
                reason: "required to listen".into(),
            })?;
        let address = config.resolve(address, true)?;

        let listener = transport::bind(address)?;
        listener.set_nonblocking(true).map_err(ConnectionError::from)?;
        let local = listener.local_addr().map_err(ConnectionError::from)?;
        runtime.directory.register(&config.name, local);
        info!("{}: listening on {local}", config.name);

        let shared = Arc::new(Shared {
            config,
            pipelines,
            factory,
            runtime,
            context,
            children: Mutex::new(Vec::new()),
        });

        let token = CancellationToken::new();
        let accept = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            thread::Builder::new()
                .name(format!("{}-accept", shared.config.name))
                .spawn(move || accept_loop(shared, listener, token))
                .map_err(Error::Thread)?
        };

        Ok(Self {
            shared,
            local,
            token,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Child channels accepted so far that are still connected.
    pub fn children(&self) -> Vec<Channel<P>> {
        let mut children = self.shared.children.lock();
        children.retain(|child| child.is_connected());
        children.clone()
    }

    /// Stops accepting, closes every child and leaves the directory.
    pub fn shutdown(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };

        self.token.cancel();
        if accept.join().is_err() {
            error!("{}: accept thread panicked", self.shared.config.name);
        }

        let children = std::mem::take(&mut *self.shared.children.lock());
        for child in children {
            child.close();
        }
        self.shared
            .runtime
            .directory
            .unregister(&self.shared.config.name);
        info!("{}: stopped listening on {}", self.shared.config.name, self.local);
    }
}

impl<P: Pipeline> Drop for Listener<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop<P: Pipeline>(
    shared: Arc<Shared<P>>,
    listener: TcpListener,
    token: CancellationToken,
) {
    let poll = shared.config.accept_poll_interval();
    while !token.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => adopt(&shared, stream, peer, &token),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) => {
                let e = ConnectionError::classify(e);
                log!(e.severity(), "{}: accept failed: {e}", shared.config.name);
                thread::sleep(poll);
            }
        }
    }
    debug!("{}: accept loop stopped", shared.config.name);
}

/// Asks a fresh pipeline whether to take the connection, then negotiates
/// and opens the child channel on the handshake pool so accepting resumes at
/// once. A child that finishes opening after shutdown began is closed.
fn adopt<P: Pipeline>(
    shared: &Arc<Shared<P>>,
    stream: TcpStream,
    peer: SocketAddr,
    token: &CancellationToken,
) {
    let name = &shared.config.name;
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| transport::apply_socket_options(&stream, &shared.config))
    {
        warn!("{name}: dropping {peer}: {e}");
        return;
    }

    let mut pipeline = (shared.pipelines)();
    let mut request = ChannelEvent::ConnectionRequest { peer, accept: true };
    pipeline.process_channel_event(&mut request);
    if let ChannelEvent::ConnectionRequest { accept: false, .. } = request {
        info!("{name}: pipeline rejected connection from {peer}");
        let _ = stream.shutdown(std::net::Shutdown::Both);
        return;
    }

    let job = Arc::clone(shared);
    let stopping = token.clone();
    let queued = shared.runtime.handshakes.execute(move || {
        let config = ChannelConfig {
            name: format!("{}/{peer}", job.config.name),
            ..job.config.clone()
        };
        let opened = job
            .factory
            .establish(stream, Side::Server, &config)
            .and_then(|transport| {
                let child = Channel::new(
                    config,
                    pipeline,
                    Arc::clone(&job.factory),
                    job.runtime.clone(),
                    Arc::clone(&job.context),
                )?;
                child.open(transport)?;
                Ok(child)
            });

        match opened {
            Ok(child) => {
                let mut children = job.children.lock();
                if stopping.is_cancelled() {
                    drop(children);
                    debug!("{}: listener stopped, closing {peer}", job.config.name);
                    child.close();
                    return;
                }
                children.retain(|child| child.is_connected());
                children.push(child);
            }
            Err(e) => log!(e.severity(), "{}: could not adopt {peer}: {e}", job.config.name),
        }
    });
    if !queued {
        warn!("{name}: handshake pool is shutting down, dropping {peer}");
    }
}
