use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of a node's stream layer.
#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub stream: StreamConfig,
    pub tls: TlsConfig,

    /// Address to export prometheus metrics on (host:port), if any.
    pub metrics_addr: Option<String>,
}

impl NodeConfig {
    /// Read and parse a TOML configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("{}: failed to read config file", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("{}: failed to parse config file", path.display()))?;

        Ok(config)
    }
}

/// Addresses and timing of the stream layer.
#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct StreamConfig {
    /// Address the node listens on and advertises to its peers.
    ///
    /// Without a port, [crate::hostport::DEFAULT_PORT] is used.
    pub address: String,

    /// Path prefix of the cluster's HTTP endpoints; the raft stream
    /// is served on `<core_prefix>/raft`.
    pub core_prefix: String,

    /// Interval of TCP keep-alive probes on dialed connections.
    #[serde(with = "human_duration")]
    pub keepalive: Duration,

    /// How long an inbound connection may take to send its request
    /// head.
    #[serde(with = "human_duration")]
    pub header_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", crate::hostport::DEFAULT_PORT),
            core_prefix: "/core".to_string(),
            // Some NAT devices close a connection after 30 seconds of
            // inactivity.
            keepalive: Duration::from_secs(25),
            header_timeout: Duration::from_secs(10),
        }
    }
}

/// Identity material of the node, as PEM files.
#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Certificate chain of the node, end-entity first.
    pub certificate: PathBuf,

    /// Private key matching the certificate.
    pub private_key: PathBuf,

    /// Root certificates of the cluster CA.
    pub ca: PathBuf,
}

mod human_duration {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
