use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Port peers listen on when an address doesn't say otherwise.
pub const DEFAULT_PORT: u16 = 4934;

/// Append [DEFAULT_PORT] to an address that has no port separator.
///
/// Addresses containing a `:` are returned unchanged.
pub fn with_default_port(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    }
}

/// HostPort represents a resolved host:port pair, with DNS resolution.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct HostPort {
    host: String,
    port: u16,
    addr: SocketAddr,
}

impl HostPort {
    /// Parse a host:port string, resolve DNS, and return a HostPort.
    pub async fn parse(s: &str) -> io::Result<Self> {
        // Handle [::1]:port for IPv6
        let (host, port) = match s.rfind(':') {
            Some(idx) => {
                let (host, port_str) = s.split_at(idx);
                let port = port_str[1..]
                    .parse::<u16>()
                    .map_err(|_| invalid_input(format!("Invalid port in address: {s}")))?;
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                (host.to_string(), port)
            }
            None => return Err(invalid_input(format!("Missing port in address: {s}"))),
        };
        let addr = tokio::net::lookup_host(s)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("DNS lookup failed for {s}"))
            })?;

        Ok(HostPort { host, port, addr })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_appended() {
        assert_eq!(with_default_port("10.0.0.5"), "10.0.0.5:4934");
        assert_eq!(with_default_port("node1.example"), "node1.example:4934");
    }

    #[test]
    fn explicit_port_kept() {
        assert_eq!(with_default_port("10.0.0.5:9000"), "10.0.0.5:9000");
        assert_eq!(with_default_port("[::1]:9000"), "[::1]:9000");
    }

    #[tokio::test]
    async fn parse_ipv4() -> anyhow::Result<()> {
        let hp = HostPort::parse("127.0.0.1:8000").await?;
        assert_eq!(hp.host(), "127.0.0.1");
        assert_eq!(hp.addr(), "127.0.0.1:8000".parse::<SocketAddr>()?);

        Ok(())
    }

    #[tokio::test]
    async fn parse_ipv6() -> anyhow::Result<()> {
        let hp = HostPort::parse("[::1]:8000").await?;
        assert_eq!(hp.host(), "::1");
        assert_eq!(hp.addr(), "[::1]:8000".parse::<SocketAddr>()?);

        Ok(())
    }

    #[tokio::test]
    async fn parse_localhost() -> anyhow::Result<()> {
        let hp = HostPort::parse("localhost:1234").await?;
        assert_eq!(hp.host(), "localhost");
        assert_eq!(hp.addr().port(), 1234);

        Ok(())
    }

    #[tokio::test]
    async fn parse_invalid() {
        assert_eq!(
            HostPort::parse("myhost").await.unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert_eq!(
            HostPort::parse("myhost:port").await.unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[tokio::test]
    async fn display() -> anyhow::Result<()> {
        let hp = HostPort::parse("127.0.0.1:8000").await?;
        assert_eq!(hp.to_string(), "127.0.0.1:8000");

        Ok(())
    }
}
