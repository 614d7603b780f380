use hyper::{Request, StatusCode};
use rustls::RootCertStore;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

use crate::config::StreamConfig;
use crate::conn::Connection;
use crate::error::StreamError;
use crate::hostport::HostPort;
use crate::http::{Handler, HijackError, ResponseWriter};
use crate::security::{self, Identity, PeerCertificates};
use crate::upgrade;
use crate::utils::async_utils::AbortOnDrop;

/// A minimal HTTP/1.1 server over TLS whose handlers can take over
/// the connection a request arrived on.
///
/// Each connection serves a single request. Requests are dispatched
/// by exact path; other paths get a 404.
///
/// Requests passed to handlers carry the certificates of the client as
/// [PeerCertificates] and its address as a [SocketAddr] extension.
pub struct HttpServer {
    acceptor: TlsAcceptor,
    header_timeout: Duration,
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl HttpServer {
    /// Create a server presenting `identity` and requiring client
    /// certificates that chain to `roots`.
    pub fn new(
        identity: &Identity,
        roots: Arc<RootCertStore>,
        config: &StreamConfig,
    ) -> Result<Self, StreamError> {
        Ok(Self {
            acceptor: security::make_tls_acceptor(identity, roots)?,
            header_timeout: config.header_timeout,
            routes: vec![],
        })
    }

    /// Send requests for `path` to `handler`.
    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.routes.push((path.into(), handler));

        self
    }

    /// Start the server, listening on the given address.
    ///
    /// The server stops accepting connections once something is sent
    /// to `shutdown` or the returned handle is dropped. Connections
    /// that were already accepted are served to completion.
    pub async fn start(
        self,
        hostport: &HostPort,
        shutdown: &broadcast::Sender<()>,
    ) -> anyhow::Result<(SocketAddr, AbortOnDrop<()>)> {
        let listener = TcpListener::bind(hostport.addr()).await?;
        let addr = listener.local_addr()?;
        log::info!("Listening for HTTP connections on {addr}");

        let server = Arc::new(self);
        let mut shutdown = shutdown.subscribe();
        let handle = AbortOnDrop::new(tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = shutdown.recv() => break,
                    res = listener.accept() => match res {
                        Ok(v) => v,
                        Err(err) => {
                            log::debug!("Failed to accept connection: {err}");
                            continue;
                        }
                    },
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(err) = server.serve_connection(stream, peer).await {
                        log::debug!("{peer}: connection rejected: {err}");
                    }
                });
            }
            log::info!("Stopped listening for HTTP connections on {addr}");
        }));

        Ok((addr, handle))
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let deadline = Instant::now() + self.header_timeout;
        let tls = tokio::time::timeout_at(deadline, self.acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
        let certs = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();

        let mut conn = Connection::new(tls).with_peer_addr(peer);
        conn.set_read_deadline(deadline);
        let mut reader = BufReader::new(conn);
        let head = upgrade::read_request_head(&mut reader).await;
        let over_read = reader.buffer().to_vec();
        let conn = reader.into_inner().with_prefix(over_read);
        let mut writer = ConnWriter { conn: Some(conn) };

        let mut request = match head {
            Ok(request) => request,
            Err(err) => {
                if err.kind() == io::ErrorKind::InvalidData {
                    writer.error(StatusCode::BAD_REQUEST, "Bad Request").await;
                }
                return Err(err);
            }
        };
        request.extensions_mut().insert(PeerCertificates(certs));
        request.extensions_mut().insert(peer);

        match self.handler_for(&request) {
            Some(handler) => handler.handle(request, &mut writer).await,
            None => writer.error(StatusCode::NOT_FOUND, "404 page not found").await,
        }
        writer.finish().await;

        Ok(())
    }

    fn handler_for(&self, request: &Request<()>) -> Option<&Arc<dyn Handler>> {
        let path = request.uri().path();
        self.routes
            .iter()
            .find(|(route, _)| route == path)
            .map(|(_, handler)| handler)
    }
}

/// [ResponseWriter] of [HttpServer].
struct ConnWriter {
    conn: Option<Connection>,
}

impl ConnWriter {
    /// Close the connection, unless it was hijacked.
    async fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.discard().await;
        }
    }
}

#[async_trait::async_trait]
impl ResponseWriter for ConnWriter {
    async fn error(&mut self, status: StatusCode, message: &str) {
        if let Some(mut conn) = self.conn.take() {
            let response = upgrade::error_response(status, message);
            if let Err(err) = conn.write_all(&response).await {
                log::debug!("Failed to send {status} response: {err}");
            }
            conn.discard().await;
        }
    }

    fn hijack(&mut self) -> Result<Connection, HijackError> {
        self.conn
            .take()
            .ok_or_else(|| HijackError::Failed("response already sent".to_string()))
    }
}
