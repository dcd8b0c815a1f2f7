use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use courier::{
    Channel, ChannelConfig, ConnectionState, Context, Envelope, FramedPipeline, Incoming,
    Listener, Outcome, Runtime, Worker,
    channel::{
        listener::PipelineFactory,
        tls::{TlsFactory, TlsTransport},
        transport::PlainFactory,
    },
    error::{ConfigurationError, ConnectionError},
    space::Entry,
};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig, ServerConnection,
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

struct Pki {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

fn pki() -> Pki {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(ring::default_provider());
    let server = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert).unwrap();
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Pki {
        server: Arc::new(server),
        client: Arc::new(client),
    }
}

fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}

fn secure_listener(
    runtime: &Runtime,
    pki: &Pki,
    require_client_certificate: bool,
) -> (Listener<FramedPipeline>, Arc<Context<Incoming<FramedPipeline>>>) {
    let inbound = Arc::new(Context::new("secure"));
    let config = ChannelConfig {
        name: "secure".into(),
        local_address: Some("127.0.0.1:0".into()),
        require_client_certificate,
        ..ChannelConfig::default()
    };
    let pipelines: PipelineFactory<FramedPipeline> = Arc::new(FramedPipeline::default);
    let listener = Listener::bind(
        config,
        pipelines,
        Arc::new(TlsFactory::server(Arc::clone(&pki.server))),
        runtime.clone(),
        Arc::clone(&inbound),
    )
    .unwrap();
    (listener, inbound)
}

fn secure_client(runtime: &Runtime, pki: &Pki, config: ChannelConfig) -> Channel<FramedPipeline> {
    Channel::new(
        config,
        FramedPipeline::default(),
        Arc::new(TlsFactory::client(Arc::clone(&pki.client), localhost())),
        runtime.clone(),
        Arc::new(Context::new("terminal")),
    )
    .unwrap()
}

fn client_config(remote: String) -> ChannelConfig {
    ChannelConfig {
        name: "terminal".into(),
        remote_address: Some(remote),
        ..ChannelConfig::default()
    }
}

#[test]
fn echo_over_tls() {
    let runtime = Runtime::new(4);
    let pki = pki();
    let (listener, inbound) = secure_listener(&runtime, &pki, false);
    let _echo = Worker::spawn(
        "echo",
        inbound,
        Duration::from_millis(10),
        |entry: Entry<Incoming<FramedPipeline>>| {
            let incoming = entry.into_value();
            incoming.reply(incoming.message().clone());
        },
    )
    .unwrap();

    let channel = secure_client(&runtime, &pki, client_config(listener.local_addr().to_string()));
    assert_eq!(channel.connect().wait_completion(WAIT, false), Outcome::Succeeded);

    let payload = vec![0x5a; 10_000];
    let sent = channel.send(Envelope::new(payload.clone()).sensitive());
    assert_eq!(sent.wait_completion(WAIT, false), Outcome::Succeeded);

    let echoed = channel.context().take(WAIT).unwrap().into_message();
    assert_eq!(echoed.body, payload);
    assert!(echoed.sensitive);

    channel.close();
}

#[test]
fn client_certificate_is_enforced() {
    let runtime = Runtime::new(4);
    let pki = pki();
    let (listener, _inbound) = secure_listener(&runtime, &pki, true);

    let channel = secure_client(&runtime, &pki, client_config(listener.local_addr().to_string()));
    channel.connect().wait_completion(WAIT, false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while channel.state() != ConnectionState::Disconnected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(listener.children().is_empty());
}

#[test]
fn revocation_checking_needs_a_provider() {
    let runtime = Runtime::new(2);
    let pki = pki();
    let (listener, _inbound) = secure_listener(&runtime, &pki, false);

    let config = ChannelConfig {
        check_certificate_revocation: true,
        ..client_config(listener.local_addr().to_string())
    };
    let channel = secure_client(&runtime, &pki, config);
    let connected = channel.connect();

    assert_eq!(connected.wait_completion(WAIT, false), Outcome::Failed);
    assert!(matches!(
        connected.error().as_deref(),
        Some(courier::Error::Configuration(ConfigurationError::MissingProvider(_)))
    ));
}

#[test]
fn stalled_negotiation_times_out() {
    let runtime = Runtime::new(2);
    let pki = pki();
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = silent.local_addr().unwrap();
    let holder = thread::spawn(move || {
        let (stream, _) = silent.accept().unwrap();
        thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let config = ChannelConfig {
        negotiation_timeout_ms: 100,
        ..client_config(address.to_string())
    };
    let channel = secure_client(&runtime, &pki, config);
    let started = Instant::now();
    let connected = channel.connect();

    assert_eq!(connected.wait_completion(WAIT, false), Outcome::Failed);
    assert!(started.elapsed() < Duration::from_millis(450));
    assert!(matches!(
        connected.error().as_deref(),
        Some(courier::Error::Connection(ConnectionError::TimedOut(_)))
    ));
    holder.join().unwrap();
}

#[test]
fn slow_handshake_is_bounded_by_the_negotiation_timeout() {
    let runtime = Runtime::new(2);
    let pki = pki();

    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_address = upstream.local_addr().unwrap();
    let server_config = Arc::clone(&pki.server);
    let server = thread::spawn(move || {
        let (stream, _) = upstream.accept().unwrap();
        let session = ServerConnection::new(server_config).unwrap();
        let _ = TlsTransport::negotiate(stream, session, Duration::from_secs(2));
    });

    // Forwards the client hello, then trickles the server's reply in two parts.
    let relay = TcpListener::bind("127.0.0.1:0").unwrap();
    let relay_address = relay.local_addr().unwrap();
    let relay = thread::spawn(move || {
        let (mut client, _) = relay.accept().unwrap();
        let mut server = TcpStream::connect(upstream_address).unwrap();
        let mut hello = [0; 4096];
        let n = client.read(&mut hello).unwrap();
        server.write_all(&hello[..n]).unwrap();

        let mut flight = [0; 16 * 1024];
        let n = server.read(&mut flight).unwrap();
        let split = n.min(5);
        thread::sleep(Duration::from_millis(250));
        let _ = client.write_all(&flight[..split]);
        thread::sleep(Duration::from_millis(250));
        let _ = client.write_all(&flight[split..n]);
        thread::sleep(Duration::from_millis(100));
    });

    let config = ChannelConfig {
        negotiation_timeout_ms: 300,
        ..client_config(relay_address.to_string())
    };
    let channel = secure_client(&runtime, &pki, config);
    let started = Instant::now();
    let connected = channel.connect();

    assert_eq!(connected.wait_completion(WAIT, false), Outcome::Failed);
    assert!(started.elapsed() < Duration::from_millis(450));
    assert!(matches!(
        connected.error().as_deref(),
        Some(courier::Error::Connection(ConnectionError::TimedOut(_)))
    ));
    relay.join().unwrap();
    server.join().unwrap();
}

#[test]
fn close_returns_while_a_write_is_stuck() {
    let runtime = Runtime::new(2);
    let pki = pki();

    // Completes the handshake, then never reads.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = silent.local_addr().unwrap();
    let server_config = Arc::clone(&pki.server);
    let (done, finished) = mpsc::channel::<()>();
    let peer = thread::spawn(move || {
        let (stream, _) = silent.accept().unwrap();
        let session = ServerConnection::new(server_config).unwrap();
        let transport = TlsTransport::negotiate(stream, session, Duration::from_secs(5)).unwrap();
        let _ = finished.recv_timeout(Duration::from_secs(10));
        drop(transport);
    });

    // A lingering close would wait on the data the peer never takes.
    let config = ChannelConfig {
        linger_secs: 0,
        ..client_config(address.to_string())
    };
    let channel = secure_client(&runtime, &pki, config);
    assert_eq!(channel.connect().wait_completion(WAIT, false), Outcome::Succeeded);

    let sent = channel.send(Envelope::new(vec![0x17; 12 * 1024 * 1024]));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(sent.outcome(), Outcome::Pending);

    let (closed_tx, closed) = mpsc::channel();
    let closer = channel.clone();
    thread::spawn(move || {
        closer.close();
        let _ = closed_tx.send(());
    });

    assert!(closed.recv_timeout(Duration::from_secs(3)).is_ok());
    assert_eq!(sent.wait_completion(WAIT, false), Outcome::Failed);
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    done.send(()).unwrap();
    peer.join().unwrap();
}

#[test]
fn silent_peers_do_not_hold_up_other_channels() {
    let runtime = Runtime::new(2);
    let pki = pki();
    let (secure, _secure_inbound) = secure_listener(&runtime, &pki, false);

    let inbound = Arc::new(Context::new("plain"));
    let pipelines: PipelineFactory<FramedPipeline> = Arc::new(FramedPipeline::default);
    let plain = Listener::bind(
        ChannelConfig {
            name: "plain".into(),
            local_address: Some("127.0.0.1:0".into()),
            ..ChannelConfig::default()
        },
        pipelines,
        Arc::new(PlainFactory),
        runtime.clone(),
        Arc::clone(&inbound),
    )
    .unwrap();
    let channel = Channel::new(
        client_config(plain.local_addr().to_string()),
        FramedPipeline::default(),
        Arc::new(PlainFactory),
        runtime.clone(),
        Arc::new(Context::new("terminal")),
    )
    .unwrap();
    assert_eq!(channel.connect().wait_completion(WAIT, false), Outcome::Succeeded);
    let deadline = Instant::now() + Duration::from_secs(5);
    while plain.children().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(plain.children().len(), 1);

    // Hold every handshake worker of the secure listener.
    let silent: Vec<TcpStream> = (0..3)
        .map(|_| TcpStream::connect(secure.local_addr()).unwrap())
        .collect();
    thread::sleep(Duration::from_millis(200));

    let sent = channel.send(Envelope::new(b"still moving".to_vec()));
    assert_eq!(
        sent.wait_completion(Some(Duration::from_secs(2)), false),
        Outcome::Succeeded
    );
    assert_eq!(inbound.take(WAIT).unwrap().message().body, b"still moving");

    drop(silent);
    channel.close();
}
