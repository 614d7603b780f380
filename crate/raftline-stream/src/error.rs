use hyper::StatusCode;

/// Errors returned by the stream layer.
///
/// Inbound variants map to an HTTP status through
/// [StreamError::status_code]; outbound variants are returned by
/// [crate::StreamListener::dial].
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Server is shutting down")]
    TransportClosed,

    #[error("This endpoint is for streaming raft")]
    ProtocolMismatch,

    #[error("{0}")]
    AuthenticationFailure(#[from] crate::security::VerifyError),

    #[error("webserver doesn't support hijacking")]
    HijackUnsupported,

    #[error("hijack failed: {0}")]
    HijackFailed(String),

    #[error("failed to dial {address}: {source}")]
    DialFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send upgrade request to {address}: {source}")]
    WriteFailure {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    /// HTTP status reported to an inbound caller rejected with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::TransportClosed => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::ProtocolMismatch => StatusCode::BAD_REQUEST,
            StreamError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            StreamError::HijackUnsupported | StreamError::HijackFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            StreamError::DialFailure { .. }
            | StreamError::WriteFailure { .. }
            | StreamError::Tls(_)
            | StreamError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True if the error means the listener has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::TransportClosed)
    }
}
