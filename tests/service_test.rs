use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use netservice::{
    setup_local_tracing, AppError, AppResult, ConnectedCallback, ConnectionService,
    ConnectionSession, OutboundMessage, Packet, PacketReader, Peer, ServiceConfig, SessionHandle,
    SessionOrigin, HEADER_SIZE,
};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;

#[fixture]
fn config() -> ServiceConfig {
    setup_local_tracing().expect("failed to setup tracing");
    let mut config = ServiceConfig::default();
    config.network.host = "127.0.0.1".to_string();
    config.network.port = 0;
    config.capacity.max_connections = 4;
    config.capacity.segment_size = 256;
    config.session.max_message_size = 256;
    config.session.keepalive_interval_ms = 0;
    config
}

/// Echoes packets back and reports removal.
struct EchoPeer {
    session: Weak<ConnectionSession>,
    removed: Arc<AtomicUsize>,
}

impl Peer for EchoPeer {
    fn on_message(&self, payload: Bytes) {
        if let Some(session) = self.session.upgrade() {
            let mut reader = PacketReader::new(payload);
            let protocol_id = reader.pop_u16().expect("protocol id");
            let mut reply = Packet::create(protocol_id);
            reply.push_bytes(&reader.rest());
            session.send(reply).expect("echo");
        }
    }

    fn on_removed(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards every decoded payload to a channel.
struct ForwardingPeer {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Peer for ForwardingPeer {
    fn on_message(&self, payload: Bytes) {
        let _ = self.tx.send(payload);
    }

    fn on_removed(&self) {}
}

fn echo_service(config: &ServiceConfig) -> AppResult<(Arc<ConnectionService>, Arc<AtomicUsize>)> {
    let service = ConnectionService::initialize(config)?;
    let removed = Arc::new(AtomicUsize::new(0));
    let removed_clone = removed.clone();
    service.set_session_created_callback(Arc::new(move |session: SessionHandle| {
        session.set_peer(Arc::new(EchoPeer {
            session: Arc::downgrade(&session),
            removed: removed_clone.clone(),
        }));
    }));
    Ok((service, removed))
}

fn frame(protocol_id: u16, text: &str) -> Vec<u8> {
    let mut packet = Packet::create(protocol_id);
    packet.push_str(text).unwrap();
    packet.record_size();
    packet.as_bytes().to_vec()
}

async fn read_frame(stream: &mut TcpStream) -> AppResult<(u16, String)> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).await?;
    let mut reader = PacketReader::new(Bytes::from(body));
    Ok((reader.pop_u16()?, reader.pop_str()?))
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_round_trip(config: ServiceConfig) -> AppResult<()> {
    let (service, removed) = echo_service(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 16)?;

    let mut client = TcpStream::connect(listen_loop.local_addr()).await?;
    // one frame split across two writes
    let bytes = frame(7, "hello");
    client.write_all(&bytes[..3]).await?;
    client.flush().await?;
    time::sleep(Duration::from_millis(20)).await;
    client.write_all(&bytes[3..]).await?;

    assert_eq!(read_frame(&mut client).await?, (7, "hello".to_string()));
    assert_eq!(service.connected_count(), 1);
    assert_eq!(service.active_sessions(), 1);

    drop(client);
    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 0 }
    })
    .await;
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(service.available_contexts(), (4, 4));

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wire_order_matches_enqueue_order(config: ServiceConfig) -> AppResult<()> {
    let (service, _removed) = echo_service(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 16)?;
    let mut client = TcpStream::connect(listen_loop.local_addr()).await?;

    let mut burst = Vec::new();
    for id in 1..=50u16 {
        burst.extend(frame(id, "x"));
    }
    client.write_all(&burst).await?;

    for id in 1..=50u16 {
        let (protocol_id, text) = read_frame(&mut client).await?;
        assert_eq!(protocol_id, id);
        assert_eq!(text, "x");
    }

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connected_count_under_parallel_accepts(
    mut config: ServiceConfig,
) -> AppResult<()> {
    const CLIENTS: usize = 16;
    config.capacity.max_connections = CLIENTS;
    let service = ConnectionService::initialize(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 64)?;
    let address = listen_loop.local_addr();

    let connects: Vec<_> = (0..CLIENTS)
        .map(|_| tokio::spawn(TcpStream::connect(address)))
        .collect();
    let mut clients = Vec::new();
    for connect in connects {
        clients.push(connect.await.expect("connect task")?);
    }

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == CLIENTS }
    })
    .await;
    assert_eq!(service.connected_count(), CLIENTS);
    assert_eq!(listen_loop.accepted(), CLIENTS as u64);

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contexts_are_reused_without_growth(config: ServiceConfig) -> AppResult<()> {
    let (service, _removed) = echo_service(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 16)?;
    let address = listen_loop.local_addr();
    let segments = service.arena().live();
    assert_eq!(segments, 8);

    for round in 0..3 {
        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(TcpStream::connect(address).await?);
        }
        let svc = service.clone();
        wait_until(|| {
            let svc = svc.clone();
            async move { svc.active_sessions() == 4 }
        })
        .await;
        assert_eq!(service.available_contexts(), (0, 0));

        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(&frame(i as u16 + 1, "round")).await?;
            assert_eq!(read_frame(client).await?, (i as u16 + 1, "round".to_string()));
        }

        drop(clients);
        let svc = service.clone();
        wait_until(|| {
            let svc = svc.clone();
            async move { svc.available_contexts() == (4, 4) }
        })
        .await;
        assert_eq!(service.arena().live(), segments, "round {}", round);
    }
    assert_eq!(service.connected_count(), 12);

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_beyond_capacity_is_dropped(mut config: ServiceConfig) -> AppResult<()> {
    config.capacity.max_connections = 1;
    let (service, _removed) = echo_service(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 16)?;
    let address = listen_loop.local_addr();

    let _first = TcpStream::connect(address).await?;
    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 1 }
    })
    .await;

    let mut second = TcpStream::connect(address).await?;
    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(5), second.read(&mut buf))
        .await
        .expect("rejected client is closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(service.active_sessions(), 1);
    assert_eq!(service.connected_count(), 2);

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connector_opens_unpooled_session(config: ServiceConfig) -> AppResult<()> {
    let (server, _removed) = echo_service(&config)?;
    let listen_loop = server.listen(&config.network.host, 0, 16)?;

    let client = ConnectionService::initialize(&config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicUsize::new(0));
    let connector = client.connector();
    {
        let connected = connected.clone();
        connector.set_connected_callback(Arc::new(move |session: SessionHandle| {
            connected.fetch_add(1, Ordering::SeqCst);
            session.set_peer(Arc::new(ForwardingPeer { tx: tx.clone() }));
        }));
    }

    let session = connector.connect(listen_loop.local_addr()).await?;
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(session.origin(), SessionOrigin::Outbound);
    assert_eq!(connector.target(), Some(listen_loop.local_addr()));

    let mut packet = Packet::create(3);
    packet.push_str("from connector")?;
    session.send(packet)?;
    let reply = time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("echo in time")
        .expect("peer channel open");
    let mut reader = PacketReader::new(reply);
    assert_eq!(reader.pop_u16()?, 3);
    assert_eq!(reader.pop_str()?, "from connector");

    // outbound sessions leave the client's pools and counter alone
    assert_eq!(client.available_contexts(), (4, 4));
    assert_eq!(client.connected_count(), 0);
    assert_eq!(client.active_sessions(), 1);

    client.close_session(&session);
    let svc = client.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 0 }
    })
    .await;
    assert_eq!(client.available_contexts(), (4, 4));
    let svc = server.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 0 }
    })
    .await;

    server.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_connector_failure_skips_callback(config: ServiceConfig) -> AppResult<()> {
    let unused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    let client = ConnectionService::initialize(&config)?;
    let connector = client.connector();
    let connected = Arc::new(AtomicUsize::new(0));
    {
        let connected = connected.clone();
        connector.set_connected_callback(Arc::new(move |_| {
            connected.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let result = connector.connect(unused).await;
    assert!(matches!(result, Err(AppError::Connect(_))));
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    // bound to its first destination
    let other: SocketAddr = "127.0.0.1:1".parse().unwrap();
    assert!(matches!(
        connector.connect(other).await,
        Err(AppError::InvalidOperation(_))
    ));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_to_uses_fresh_connector(config: ServiceConfig) -> AppResult<()> {
    let (server, _removed) = echo_service(&config)?;
    let listen_loop = server.listen(&config.network.host, 0, 16)?;
    let client = ConnectionService::initialize(&config)?;

    let connected = Arc::new(AtomicUsize::new(0));
    let callback: ConnectedCallback = {
        let connected = connected.clone();
        Arc::new(move |_: SessionHandle| {
            connected.fetch_add(1, Ordering::SeqCst);
        })
    };
    let first = client
        .connect_to(listen_loop.local_addr(), Some(callback))
        .await?;
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(first.origin(), SessionOrigin::Outbound);

    // no connector is pinned, a second destination is fine
    let other = server.listen(&config.network.host, 0, 16)?;
    let second = client.connect_to(other.local_addr(), None).await?;
    assert_ne!(first.id(), second.id());
    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(client.connected_count(), 0);
    assert_eq!(client.available_contexts(), (4, 4));

    let unused = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?
    };
    assert!(matches!(
        client.connect_to(unused, None).await,
        Err(AppError::Connect(_))
    ));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_session_disconnects_client(config: ServiceConfig) -> AppResult<()> {
    let service = ConnectionService::initialize(&config)?;
    let sessions = Arc::new(Mutex::new(Vec::new()));
    {
        let sessions = sessions.clone();
        service.set_session_created_callback(Arc::new(move |session: SessionHandle| {
            sessions.lock().push(session);
        }));
    }
    let listen_loop = service.listen(&config.network.host, 0, 16)?;
    let mut client = TcpStream::connect(listen_loop.local_addr()).await?;

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 1 }
    })
    .await;
    let session = sessions.lock()[0].clone();
    assert_eq!(session.origin(), SessionOrigin::Inbound);
    assert!(service.session(session.id()).is_some());

    service.close_session(&session);
    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client sees the close");
    assert!(matches!(read, Ok(0) | Err(_)));

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.available_contexts() == (4, 4) }
    })
    .await;
    assert!(matches!(
        session.send(Bytes::from_static(b"late")),
        Err(AppError::SessionClosed(_))
    ));

    service.shutdown();
    listen_loop.join().await;
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_tears_down_sessions(config: ServiceConfig) -> AppResult<()> {
    let (service, removed) = echo_service(&config)?;
    let listen_loop = service.listen(&config.network.host, 0, 16)?;
    let address = listen_loop.local_addr();
    let _a = TcpStream::connect(address).await?;
    let _b = TcpStream::connect(address).await?;

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.active_sessions() == 2 }
    })
    .await;

    service.shutdown();
    listen_loop.join().await;

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move { svc.available_contexts() == (4, 4) }
    })
    .await;
    assert_eq!(service.active_sessions(), 0);
    assert_eq!(removed.load(Ordering::SeqCst), 2);
    Ok(())
}
