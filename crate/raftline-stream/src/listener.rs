use hyper::Request;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::conn::Connection;
use crate::error::StreamError;
use crate::hostport::{self, HostPort};
use crate::http::{Handler, HijackError, ResponseWriter};
use crate::metrics::{self, Metrics};
use crate::security::{self, CertificateAuthority, Identity, PeerIdentity};
use crate::upgrade;

/// The byte-pipe transport a consensus engine runs over.
///
/// `accept` must never silently drop a connection and must return
/// [StreamError::TransportClosed] promptly once `close` has been
/// called.
#[async_trait::async_trait]
pub trait StreamLayer: Send + Sync {
    /// Open a connection to the peer at `address`.
    async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection, StreamError>;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Connection, StreamError>;

    /// Stop accepting connections.
    fn close(&self);

    /// Address peers use to reach this node.
    fn addr(&self) -> StreamAddr;
}

/// Address of a [StreamListener].
///
/// This is a copy; it stays valid after the listener is closed or
/// dropped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamAddr {
    address: String,
}

impl StreamAddr {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Name of the network, always "tcp".
    pub fn network(&self) -> &'static str {
        "tcp"
    }
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// A connection waiting in the handoff channel.
struct Handoff {
    conn: Connection,
    taken: oneshot::Sender<()>,
}

/// Raft stream layer on top of an HTTP server.
///
/// Outbound connections are opened by [StreamListener::dial].
/// Inbound connections arrive as HTTP upgrade requests, passed by the
/// HTTP server to [StreamListener::serve_http], which hands them
/// over to [StreamListener::accept].
pub struct StreamListener {
    addr: StreamAddr,
    core_prefix: String,
    keepalive: Duration,
    shutdown: CancellationToken,
    handoff_tx: mpsc::Sender<Handoff>,
    handoff_rx: Mutex<mpsc::Receiver<Handoff>>,
    connector: TlsConnector,
    ca: Arc<dyn CertificateAuthority>,
    roots: Arc<RootCertStore>,
    metrics: Arc<dyn Metrics>,
}

impl StreamListener {
    /// Create a listener for the node at `config.address`.
    ///
    /// The trusted roots are read from `ca` once, here.
    pub fn new(
        config: &StreamConfig,
        identity: &Identity,
        ca: Arc<dyn CertificateAuthority>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, StreamError> {
        let roots = ca.root_store();
        let connector = security::make_tls_connector(identity, Arc::clone(&roots))?;
        for name in metrics::COUNTERS {
            metrics.counter_init(name);
        }
        let (handoff_tx, handoff_rx) = mpsc::channel(1);

        Ok(Self {
            addr: StreamAddr::new(hostport::with_default_port(&config.address)),
            core_prefix: config.core_prefix.clone(),
            keepalive: config.keepalive,
            shutdown: CancellationToken::new(),
            handoff_tx,
            handoff_rx: Mutex::new(handoff_rx),
            connector,
            ca,
            roots,
            metrics,
        })
    }

    /// Address of this node.
    pub fn addr(&self) -> StreamAddr {
        self.addr.clone()
    }

    /// Path of the raft endpoint, to route to [StreamListener::serve_http].
    pub fn path(&self) -> String {
        upgrade::raft_path(&self.core_prefix)
    }

    /// Root certificates peers are verified against.
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Open a raft stream to the peer at `address`.
    ///
    /// Port [hostport::DEFAULT_PORT] is used if `address` has none.
    /// The connection is established and the upgrade request sent
    /// within `timeout`. There is no retry.
    ///
    /// Dialing a closed listener fails with
    /// [StreamError::TransportClosed].
    pub async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection, StreamError> {
        if self.is_closed() {
            return Err(StreamError::TransportClosed);
        }
        let address = hostport::with_default_port(address);
        let deadline = Instant::now() + timeout;

        self.metrics.counter_inc(metrics::HTTP_DIALED, 1);
        log::debug!("Dialing {address}");

        let (tls, peer_addr) = match tokio::time::timeout_at(deadline, self.connect(&address))
            .await
            .unwrap_or_else(|_| Err(timed_out()))
        {
            Ok(v) => v,
            Err(source) => {
                self.metrics.counter_inc(metrics::HTTP_FAILED, 1);
                log::debug!("Failed to dial {address}: {source}");
                return Err(StreamError::DialFailure { address, source });
            }
        };

        let conn = Connection::new(tls).with_peer_addr(peer_addr);

        self.send_upgrade_request(conn, address, deadline).await
    }

    /// Write the upgrade request to a freshly established connection.
    ///
    /// On failure, the connection is shut down.
    async fn send_upgrade_request(
        &self,
        mut conn: Connection,
        address: String,
        deadline: Instant,
    ) -> Result<Connection, StreamError> {
        let request = upgrade::upgrade_request(&self.core_prefix, &address);
        let sent = tokio::time::timeout_at(deadline, async {
            conn.write_all(request.as_bytes()).await?;
            conn.flush().await
        })
        .await
        .unwrap_or_else(|_| Err(timed_out()));
        if let Err(source) = sent {
            conn.discard().await;
            self.metrics.counter_inc(metrics::HTTP_FAILED, 1);
            log::debug!("Failed to send upgrade request to {address}: {source}");
            return Err(StreamError::WriteFailure { address, source });
        }

        Ok(conn)
    }

    async fn connect(&self, address: &str) -> io::Result<(TlsStream<TcpStream>, SocketAddr)> {
        let hostport = HostPort::parse(address).await?;
        let domain = ServerName::try_from(hostport.host().to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let stream = TcpStream::connect(hostport.addr()).await?;
        stream.set_nodelay(true)?;
        set_keepalive(&stream, self.keepalive)?;

        let tls = self.connector.connect(domain, stream).await?;

        Ok((tls, hostport.addr()))
    }

    /// Wait for the next inbound connection.
    ///
    /// Fails with [StreamError::TransportClosed] once the listener is
    /// closed, including when [StreamListener::close] is called while
    /// waiting.
    pub async fn accept(&self) -> Result<Connection, StreamError> {
        if self.is_closed() {
            return Err(StreamError::TransportClosed);
        }

        let mut rx = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(StreamError::TransportClosed),
            rx = self.handoff_rx.lock() => rx,
        };
        let handoff = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                drain(&mut rx);
                return Err(StreamError::TransportClosed);
            }
            handoff = rx.recv() => handoff,
        };
        drop(rx);
        if self.is_closed() {
            // close() may have found the channel locked by this call;
            // anything it couldn't drain is drained here.
            drain(&mut *self.handoff_rx.lock().await);
            return Err(StreamError::TransportClosed);
        }

        match handoff {
            Some(Handoff { conn, taken }) => {
                let _ = taken.send(());
                self.metrics.counter_inc(metrics::HTTP_ACCEPTED, 1);

                Ok(conn)
            }
            None => Err(StreamError::TransportClosed),
        }
    }

    /// Close the listener.
    ///
    /// Calls to [StreamListener::accept], pending or future, fail with
    /// [StreamError::TransportClosed]. Connections waiting in the
    /// handoff channel are closed. Calling this more than once has no
    /// further effect.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        log::debug!("Stream listener {} closed", self.addr);

        if let Ok(mut rx) = self.handoff_rx.try_lock() {
            drain(&mut rx);
        }
    }

    /// Serve an inbound upgrade request.
    ///
    /// On success, the connection is taken over from `writer` and
    /// handed to an [StreamListener::accept] call; this waits until
    /// that happens or the listener is closed. Rejected requests get
    /// an HTTP error response, and their connection is left to the
    /// HTTP server.
    pub async fn serve_http(
        &self,
        request: &Request<()>,
        writer: &mut dyn ResponseWriter,
    ) -> Result<PeerIdentity, StreamError> {
        self.metrics.counter_inc(metrics::HTTP_SERVED, 1);

        let (identity, conn) = match self.admit(request, writer) {
            Ok(v) => v,
            Err(err) => {
                writer.error(err.status_code(), &err.to_string()).await;
                return Err(err);
            }
        };

        let peer_addr = conn.peer_addr();
        self.hand_off(conn).await?;
        match peer_addr {
            Some(addr) => log::info!("Accepted raft stream from {identity} at {addr}"),
            None => log::info!("Accepted raft stream from {identity}"),
        }

        Ok(identity)
    }

    /// Check the request and take over its connection.
    fn admit(
        &self,
        request: &Request<()>,
        writer: &mut dyn ResponseWriter,
    ) -> Result<(PeerIdentity, Connection), StreamError> {
        if self.is_closed() {
            return Err(StreamError::TransportClosed);
        }
        if !upgrade::is_upgrade_request(request) {
            return Err(StreamError::ProtocolMismatch);
        }
        let identity = self.ca.verify_request(request)?;
        let mut conn = writer.hijack().map_err(|err| match err {
            HijackError::Unsupported => StreamError::HijackUnsupported,
            HijackError::Failed(msg) => StreamError::HijackFailed(msg),
        })?;
        conn.clear_deadlines();

        Ok((identity, conn))
    }

    async fn hand_off(&self, conn: Connection) -> Result<(), StreamError> {
        let (taken_tx, taken_rx) = oneshot::channel();
        let handoff = Handoff {
            conn,
            taken: taken_tx,
        };

        // Dropping the handoff closes its connection.
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(StreamError::TransportClosed),
            sent = self.handoff_tx.send(handoff) => {
                if sent.is_err() {
                    return Err(StreamError::TransportClosed);
                }
            }
        }
        tokio::select! {
            biased;
            taken = taken_rx => taken.map_err(|_| StreamError::TransportClosed),
            _ = self.shutdown.cancelled() => Err(StreamError::TransportClosed),
        }
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamListener")
            .field("addr", &self.addr)
            .field("core_prefix", &self.core_prefix)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Close the channel and any connection still waiting in it.
fn drain(rx: &mut mpsc::Receiver<Handoff>) {
    rx.close();
    while let Ok(handoff) = rx.try_recv() {
        log::debug!(
            "Dropping unaccepted connection from {:?}",
            handoff.conn.peer_addr()
        );
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "timed out")
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let secs = u32::try_from(interval.as_secs().max(1)).unwrap_or(u32::MAX);
        setsockopt(stream, sockopt::TcpKeepIdle, &secs)?;
        setsockopt(stream, sockopt::TcpKeepInterval, &secs)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = interval;

    Ok(())
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream, _interval: Duration) -> io::Result<()> {
    Ok(())
}

#[async_trait::async_trait]
impl StreamLayer for StreamListener {
    async fn dial(&self, address: &str, timeout: Duration) -> Result<Connection, StreamError> {
        StreamListener::dial(self, address, timeout).await
    }

    async fn accept(&self) -> Result<Connection, StreamError> {
        StreamListener::accept(self).await
    }

    fn close(&self) {
        StreamListener::close(self)
    }

    fn addr(&self) -> StreamAddr {
        StreamListener::addr(self)
    }
}

#[async_trait::async_trait]
impl Handler for StreamListener {
    async fn handle(&self, request: Request<()>, writer: &mut dyn ResponseWriter) {
        if let Err(err) = self.serve_http(&request, writer).await {
            log::debug!(
                "Rejected raft stream request for {}: {err}",
                request.uri()
            );
        }
    }
}
