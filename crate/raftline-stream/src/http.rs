//! Boundary between the stream layer and the HTTP server that
//! receives inbound upgrade requests.

use hyper::{Request, StatusCode};

use crate::conn::Connection;

/// Why a [ResponseWriter] could not give up its connection.
#[derive(Debug, thiserror::Error)]
pub enum HijackError {
    /// The writer can never transfer ownership of its connection.
    #[error("webserver doesn't support hijacking")]
    Unsupported,

    /// Ownership could not be transferred for this request.
    #[error("{0}")]
    Failed(String),
}

/// Answers a single HTTP request.
///
/// HTTP servers that embed a [crate::StreamListener] must be able to
/// hand over the connection a request arrived on; writers that cannot
/// do it must return [HijackError::Unsupported] from
/// [ResponseWriter::hijack].
#[async_trait::async_trait]
pub trait ResponseWriter: Send {
    /// Send a plain-text error response.
    async fn error(&mut self, status: StatusCode, message: &str);

    /// Take exclusive ownership of the connection the request arrived
    /// on.
    ///
    /// Once this succeeds, the HTTP server doesn't touch the
    /// connection anymore and nothing more can be written through
    /// this writer.
    fn hijack(&mut self) -> Result<Connection, HijackError>;
}

/// Serves requests routed to it by an HTTP server.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request<()>, writer: &mut dyn ResponseWriter);
}
