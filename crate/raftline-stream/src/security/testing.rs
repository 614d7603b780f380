//! Throw-away certificate authority for tests.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use super::{ClusterCa, Identity};

/// A self-signed CA that issues node certificates valid for
/// `localhost` and `127.0.0.1`.
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key = KeyPair::generate().expect("CA key generation");
        let cert = params.self_signed(&key).expect("CA self-signing");

        Self { cert, key }
    }

    pub fn root(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn root_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn root_store(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        store.add(self.root()).expect("valid CA certificate");

        store
    }

    pub fn cluster_ca(&self) -> ClusterCa {
        ClusterCa::new(self.root_store()).expect("valid cluster CA")
    }

    /// Issue a certificate for a node; returns its PEM-encoded
    /// certificate and private key.
    pub fn issue_pem(&self, node_name: &str) -> (String, String) {
        let (cert, key) = self.issue_raw(node_name);

        (cert.pem(), key.serialize_pem())
    }

    /// Issue a certificate for a node.
    pub fn issue(&self, node_name: &str) -> Identity {
        let (cert, key) = self.issue_raw(node_name);

        Identity::new(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("valid node identity")
    }

    fn issue_raw(&self, node_name: &str) -> (rcgen::Certificate, KeyPair) {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("valid subject alt names");
        params.distinguished_name.push(DnType::CommonName, node_name);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate().expect("node key generation");
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("node certificate signing");

        (cert, key)
    }
}
