//! Raft stream layer over HTTP.
//!
//! Nodes of a raft cluster exchange consensus traffic over long-lived
//! TLS connections. A connection is opened by dialing the peer's HTTP
//! server and sending an upgrade request to `<core-prefix>/raft`; once
//! the peer has verified the caller, both ends use the connection as
//! a raw byte stream.
//!
//! - [StreamListener] implements the stream layer: dial, accept,
//!   close and addr, plus [StreamListener::serve_http] to be called
//!   by the HTTP server for upgrade requests.
//! - [server::HttpServer] is an HTTP server that supports handing
//!   over connections.
//! - [security] holds TLS setup and peer verification.
//! - [config] is the TOML configuration of a node.

pub mod config;
pub mod conn;
pub mod error;
pub mod hostport;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod security;
pub mod server;
pub mod upgrade;
pub mod utils;

pub use conn::Connection;
pub use error::StreamError;
pub use listener::{StreamAddr, StreamLayer, StreamListener};
