use raftline_stream::config::StreamConfig;
use raftline_stream::hostport::HostPort;
use raftline_stream::metrics::{self, RecordingMetrics};
use raftline_stream::security::testing::TestCa;
use raftline_stream::server::HttpServer;
use raftline_stream::utils::async_utils::AbortOnDrop;
use raftline_stream::{StreamError, StreamListener};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::broadcast;

/// A node with its stream listener mounted on an HTTP server.
struct Node {
    listener: Arc<StreamListener>,
    metrics: Arc<RecordingMetrics>,
    addr: SocketAddr,
    _shutdown: broadcast::Sender<()>,
    _server: AbortOnDrop<()>,
}

impl Node {
    async fn start(ca: &TestCa, name: &str) -> anyhow::Result<Self> {
        let config = StreamConfig {
            address: "127.0.0.1".to_string(),
            ..StreamConfig::default()
        };
        let identity = ca.issue(name);
        let metrics = Arc::new(RecordingMetrics::new());
        let listener = Arc::new(StreamListener::new(
            &config,
            &identity,
            Arc::new(ca.cluster_ca()),
            metrics.clone(),
        )?);

        let (shutdown, _) = broadcast::channel(1);
        let (addr, server) = HttpServer::new(&identity, listener.roots(), &config)?
            .route(listener.path(), listener.clone())
            .start(&HostPort::parse("127.0.0.1:0").await?, &shutdown)
            .await?;

        Ok(Self {
            listener,
            metrics,
            addr,
            _shutdown: shutdown,
            _server: server,
        })
    }
}

#[tokio::test]
async fn dial_and_accept_over_tls() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let ca = TestCa::new("cluster");
    let a = Node::start(&ca, "a").await?;
    let b = Node::start(&ca, "b").await?;

    let listener = Arc::clone(&b.listener);
    let accept = AbortOnDrop::new(tokio::spawn(async move { listener.accept().await }));

    let mut outbound = a
        .listener
        .dial(&b.addr.to_string(), Duration::from_secs(5))
        .await?;
    // Sent right behind the upgrade request.
    outbound.write_all(b"append entries").await?;
    outbound.flush().await?;

    let mut inbound = tokio::time::timeout(Duration::from_secs(5), accept.join()).await???;
    let mut buf = [0u8; 14];
    inbound.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"append entries");

    inbound.write_all(b"ack").await?;
    inbound.flush().await?;
    let mut buf = [0u8; 3];
    outbound.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ack");

    assert_eq!(a.metrics.count(metrics::HTTP_DIALED), 1);
    assert_eq!(a.metrics.count(metrics::HTTP_FAILED), 0);
    assert_eq!(b.metrics.count(metrics::HTTP_SERVED), 1);
    assert_eq!(b.metrics.count(metrics::HTTP_ACCEPTED), 1);

    Ok(())
}

#[tokio::test]
async fn dial_closed_peer() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let ca = TestCa::new("cluster");
    let a = Node::start(&ca, "a").await?;
    let b = Node::start(&ca, "b").await?;
    b.listener.close();

    // The upgrade request goes through; the rejection comes back as an
    // HTTP response on the connection.
    let mut conn = a
        .listener
        .dial(&b.addr.to_string(), Duration::from_secs(5))
        .await?;
    let mut response = String::new();
    conn.read_to_string(&mut response).await?;
    assert!(
        response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "{response}"
    );
    assert!(response.ends_with("Server is shutting down\n"), "{response}");

    assert!(matches!(
        b.listener.accept().await,
        Err(StreamError::TransportClosed)
    ));
    assert_eq!(b.metrics.count(metrics::HTTP_SERVED), 1);
    assert_eq!(b.metrics.count(metrics::HTTP_ACCEPTED), 0);

    Ok(())
}

#[tokio::test]
async fn reject_peer_from_another_cluster() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let b = Node::start(&TestCa::new("cluster"), "b").await?;
    let stranger = Node::start(&TestCa::new("other"), "stranger").await?;

    // The server certificate doesn't verify.
    let res = stranger
        .listener
        .dial(&b.addr.to_string(), Duration::from_secs(5))
        .await;
    assert!(matches!(res, Err(StreamError::DialFailure { .. })));
    assert_eq!(stranger.metrics.count(metrics::HTTP_FAILED), 1);
    assert_eq!(b.metrics.count(metrics::HTTP_SERVED), 0);

    Ok(())
}
