#[cfg(any(test, feature = "testing"))]
pub mod testing;

use base64::Engine as _;
use hyper::Request;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::version::TLS13;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::Digest as _;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::StreamError;

pub use rustls::crypto::aws_lc_rs::default_provider;

/// The certificate authority the node trusts.
///
/// The stream layer reads the trusted roots once, when the listener is
/// created, and asks the authority to identify the caller of every
/// inbound request.
pub trait CertificateAuthority: Send + Sync {
    /// Trusted root certificates of the cluster.
    fn root_store(&self) -> Arc<RootCertStore>;

    /// Identify the peer that sent the given request.
    fn verify_request(&self, request: &Request<()>) -> Result<PeerIdentity, VerifyError>;
}

/// Why [CertificateAuthority::verify_request] rejected a request.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("no client certificate presented")]
    NoCertificate,

    #[error("client certificate rejected: {0}")]
    Rejected(#[from] rustls::Error),

    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

/// Identity of a verified peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identify a peer by the fingerprint of its end-entity certificate.
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Self {
        Self(base64::prelude::BASE64_STANDARD.encode(sha2::Sha256::digest(cert)))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Certificates presented by the remote end of a TLS connection.
///
/// The HTTP layer attaches this to the extensions of every request it
/// reads from a TLS connection, end-entity certificate first.
#[derive(Clone, Debug, Default)]
pub struct PeerCertificates(pub Vec<CertificateDer<'static>>);

/// Certificate chain and private key that prove the identity of the
/// local node.
pub struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, StreamError> {
        if chain.is_empty() {
            return Err(StreamError::Config("empty certificate chain".to_string()));
        }

        Ok(Self { chain, key })
    }

    /// Parse a PEM-encoded certificate chain and private key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, StreamError> {
        let chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StreamError::Config(format!("invalid certificate chain: {err}")))?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|err| StreamError::Config(format!("invalid private key: {err}")))?;

        Self::new(chain, key)
    }

    /// Read a PEM-encoded certificate chain and private key from files.
    pub fn from_pem_files(chain_path: &Path, key_path: &Path) -> Result<Self, StreamError> {
        let chain = CertificateDer::pem_file_iter(chain_path)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|err| StreamError::Config(format!("{}: {err}", chain_path.display())))?;
        let key = PrivateKeyDer::from_pem_file(key_path)
            .map_err(|err| StreamError::Config(format!("{}: {err}", key_path.display())))?;

        Self::new(chain, key)
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Create a TlsConnector (client-side) presenting `identity` and
/// accepting only servers whose certificate chains to `roots`.
///
/// Server certificates must also be valid for the name that is dialed.
pub(crate) fn make_tls_connector(
    identity: &Identity,
    roots: Arc<RootCertStore>,
) -> Result<TlsConnector, StreamError> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&TLS13])?
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Create a TlsAcceptor (server-side) presenting `identity` and
/// requiring clients to present a certificate that chains to `roots`.
pub fn make_tls_acceptor(
    identity: &Identity,
    roots: Arc<RootCertStore>,
) -> Result<TlsAcceptor, StreamError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&TLS13])?
        .with_client_cert_verifier(client_verifier(roots)?)
        .with_single_cert(identity.chain.clone(), identity.key.clone_key())?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(default_provider())
}

fn client_verifier(roots: Arc<RootCertStore>) -> Result<Arc<dyn ClientCertVerifier>, StreamError> {
    WebPkiClientVerifier::builder_with_provider(roots, provider())
        .build()
        .map_err(|err| StreamError::Config(format!("client verifier: {err}")))
}

/// A [CertificateAuthority] backed by a fixed set of root certificates.
///
/// Requests are accepted if they carry a client certificate chain
/// that verifies against the roots. The peer is identified by the
/// fingerprint of its certificate.
pub struct ClusterCa {
    roots: Arc<RootCertStore>,
    verifier: Arc<dyn ClientCertVerifier>,
}

impl ClusterCa {
    pub fn new(roots: RootCertStore) -> Result<Self, StreamError> {
        if roots.is_empty() {
            return Err(StreamError::Config("no trusted root certificate".to_string()));
        }
        let roots = Arc::new(roots);
        let verifier = client_verifier(Arc::clone(&roots))?;

        Ok(Self { roots, verifier })
    }

    /// Trust the PEM-encoded root certificates.
    pub fn from_pem(pem: &[u8]) -> Result<Self, StreamError> {
        let certs = CertificateDer::pem_slice_iter(pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StreamError::Config(format!("invalid CA certificate: {err}")))?;

        Self::from_certificates(certs)
    }

    /// Trust the root certificates found in the given PEM file.
    pub fn from_pem_file(path: &Path) -> Result<Self, StreamError> {
        let certs = CertificateDer::pem_file_iter(path)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|err| StreamError::Config(format!("{}: {err}", path.display())))?;

        Self::from_certificates(certs)
    }

    fn from_certificates(certs: Vec<CertificateDer<'static>>) -> Result<Self, StreamError> {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }

        Self::new(roots)
    }
}

impl CertificateAuthority for ClusterCa {
    fn root_store(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    fn verify_request(&self, request: &Request<()>) -> Result<PeerIdentity, VerifyError> {
        let certs = request
            .extensions()
            .get::<PeerCertificates>()
            .map(|c| c.0.as_slice())
            .unwrap_or(&[]);
        let (end_entity, intermediates) = certs.split_first().ok_or(VerifyError::NoCertificate)?;
        self.verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())?;

        Ok(PeerIdentity::from_certificate(end_entity))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestCa;
    use super::*;
    use crate::utils::async_utils::AbortOnDrop;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn tls_acceptor_connector() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let roots = Arc::new(ca.root_store());
        let acceptor = make_tls_acceptor(&ca.issue("server"), Arc::clone(&roots))?;
        let connector = make_tls_connector(&ca.issue("client"), roots)?;

        test_connect(acceptor, connector, "localhost").await?;

        Ok(())
    }

    #[tokio::test]
    async fn tls_connect_by_ip() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let roots = Arc::new(ca.root_store());
        let acceptor = make_tls_acceptor(&ca.issue("server"), Arc::clone(&roots))?;
        let connector = make_tls_connector(&ca.issue("client"), roots)?;

        test_connect(acceptor, connector, "127.0.0.1").await?;

        Ok(())
    }

    #[tokio::test]
    async fn tls_reject_server_from_other_ca() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let other = TestCa::new("other");
        let acceptor = make_tls_acceptor(&other.issue("server"), Arc::new(ca.root_store()))?;
        let connector = make_tls_connector(&ca.issue("client"), Arc::new(ca.root_store()))?;

        assert!(test_connect(acceptor, connector, "localhost").await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn tls_reject_client_from_other_ca() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let other = TestCa::new("other");
        let acceptor = make_tls_acceptor(&ca.issue("server"), Arc::new(ca.root_store()))?;
        let connector = make_tls_connector(&other.issue("client"), Arc::new(ca.root_store()))?;

        assert!(test_connect(acceptor, connector, "localhost").await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn tls_reject_client_without_cert() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let acceptor = make_tls_acceptor(&ca.issue("server"), Arc::new(ca.root_store()))?;

        // Misconfigured connector; no client auth.
        let bad_connector = {
            let config = ClientConfig::builder_with_provider(provider())
                .with_protocol_versions(&[&TLS13])?
                .with_root_certificates(ca.root_store())
                .with_no_client_auth();

            TlsConnector::from(Arc::new(config))
        };

        assert!(test_connect(acceptor, bad_connector, "localhost").await.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn tls_reject_wrong_server_name() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let roots = Arc::new(ca.root_store());
        let acceptor = make_tls_acceptor(&ca.issue("server"), Arc::clone(&roots))?;
        let connector = make_tls_connector(&ca.issue("client"), roots)?;

        assert!(
            test_connect(acceptor, connector, "elsewhere.example")
                .await
                .is_err()
        );

        Ok(())
    }

    #[test]
    fn verify_request_with_cluster_certificate() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let client = ca.issue("client");
        let request = request_with_certs(client.chain().to_vec());

        let identity = ca.cluster_ca().verify_request(&request)?;
        assert_eq!(identity, PeerIdentity::from_certificate(&client.chain()[0]));

        Ok(())
    }

    #[test]
    fn verify_request_without_certificate() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");

        let request = Request::builder().body(())?;
        assert!(matches!(
            ca.cluster_ca().verify_request(&request),
            Err(VerifyError::NoCertificate)
        ));

        let request = request_with_certs(vec![]);
        assert!(matches!(
            ca.cluster_ca().verify_request(&request),
            Err(VerifyError::NoCertificate)
        ));

        Ok(())
    }

    #[test]
    fn verify_request_from_other_ca() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let other = TestCa::new("other");
        let request = request_with_certs(other.issue("client").chain().to_vec());

        assert!(matches!(
            ca.cluster_ca().verify_request(&request),
            Err(VerifyError::Rejected(_))
        ));

        Ok(())
    }

    #[test]
    fn identity_from_pem() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");
        let (cert_pem, key_pem) = ca.issue_pem("node");

        let identity = Identity::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;
        assert_eq!(identity.chain().len(), 1);

        assert!(Identity::from_pem(b"", key_pem.as_bytes()).is_err());
        assert!(Identity::from_pem(cert_pem.as_bytes(), b"garbage").is_err());

        Ok(())
    }

    #[test]
    fn cluster_ca_from_pem() -> anyhow::Result<()> {
        let ca = TestCa::new("cluster");

        let cluster_ca = ClusterCa::from_pem(ca.root_pem().as_bytes())?;
        assert_eq!(cluster_ca.root_store().len(), 1);

        assert!(ClusterCa::from_pem(b"").is_err());

        Ok(())
    }

    fn request_with_certs(certs: Vec<CertificateDer<'static>>) -> Request<()> {
        let mut request = Request::new(());
        request.extensions_mut().insert(PeerCertificates(certs));

        request
    }

    async fn test_connect(
        acceptor: TlsAcceptor,
        connector: TlsConnector,
        name: &str,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle: AbortOnDrop<anyhow::Result<()>> = AbortOnDrop::new(tokio::spawn(async move {
            let (tcp, _) = listener.accept().await?;

            let mut tls = acceptor.accept(tcp).await?;
            tls.write_all(b"foobar").await?;
            tls.shutdown().await?;

            Ok(())
        }));

        let tcp = TcpStream::connect(addr).await?;
        let domain = ServerName::try_from(name.to_string())?;
        let mut tls = connector.connect(domain, tcp).await?;
        let mut buf = vec![0u8; 6];
        tls.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"foobar");

        handle.join().await??;
        Ok(())
    }
}
