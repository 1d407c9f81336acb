//! TLS termination with rustls and SNI support
//!
//! - Parse certificate/key pairs from TLS secrets
//! - Select the certificate per handshake from the published routing snapshot
//! - No default certificate: an unknown or missing SNI name fails the handshake

use crate::error::TlsError;
use crate::proxy::metrics::record_tls_handshake_failure;
use crate::proxy::router::RoutingTable;
use common::{normalize_host, ResourceKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

/// ALPN protocols offered by the TLS listener
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// TLS certificate loaded from a Kubernetes Secret
#[derive(Clone)]
pub struct TlsCertificate {
    /// Certificate chain (PEM format)
    pub cert_chain: Vec<u8>,
    /// Private key (PEM format)
    pub private_key: Vec<u8>,
}

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificate")
            .field("cert_chain", &format_args!("{} bytes", self.cert_chain.len()))
            .finish_non_exhaustive()
    }
}

impl TlsCertificate {
    /// Load certificate and private key from PEM bytes
    ///
    /// Both halves must parse and the chain must hold at least one
    /// certificate.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let certificate = Self {
            cert_chain: cert_pem.to_vec(),
            private_key: key_pem.to_vec(),
        };
        certificate.parse_chain()?;
        certificate.parse_key()?;
        Ok(certificate)
    }

    fn parse_chain(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let mut cert_reader = BufReader::new(&self.cert_chain[..]);
        let chain = certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(TlsError::NoCertificate);
        }
        Ok(chain)
    }

    fn parse_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        let mut key_reader = BufReader::new(&self.private_key[..]);
        private_key(&mut key_reader)?.ok_or(TlsError::NoPrivateKey)
    }

    /// Build the signing material rustls serves during a handshake
    pub fn to_certified_key(&self) -> Result<CertifiedKey, TlsError> {
        let chain = self.parse_chain()?;
        let key = self.parse_key()?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        let certified = CertifiedKey::new(chain, signing_key);
        match certified.keys_match() {
            Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::KeyMismatch)) => {
                Err(TlsError::KeyMismatch)
            }
            // Unknown means the signing key cannot expose its public half
            _ => Ok(certified),
        }
    }
}

/// Certificate served for one SNI host
pub struct CertificateEntry {
    pub sni_host: String,
    pub certified_key: Arc<CertifiedKey>,
    /// Secret the certificate was loaded from
    pub source_secret: ResourceKey,
}

impl CertificateEntry {
    pub fn new(
        sni_host: &str,
        certificate: &TlsCertificate,
        source_secret: ResourceKey,
    ) -> Result<Self, TlsError> {
        Ok(Self {
            sni_host: normalize_host(sni_host),
            certified_key: Arc::new(certificate.to_certified_key()?),
            source_secret,
        })
    }

    /// Share already-parsed key material under another host name
    pub fn for_host(&self, sni_host: &str) -> Self {
        Self {
            sni_host: normalize_host(sni_host),
            certified_key: self.certified_key.clone(),
            source_secret: self.source_secret.clone(),
        }
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }
}

impl fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("sni_host", &self.sni_host)
            .field("source_secret", &self.source_secret)
            .field("chain_len", &self.certified_key.cert.len())
            .finish()
    }
}

/// Per-handshake certificate selection from the current routing snapshot
pub struct SnapshotCertResolver {
    table: Arc<RoutingTable>,
}

impl SnapshotCertResolver {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }
}

impl fmt::Debug for SnapshotCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SnapshotCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("TLS handshake without SNI rejected");
            record_tls_handshake_failure("no_sni");
            return None;
        };

        let host = normalize_host(server_name);
        match self.table.current().certificate_for(&host) {
            Some(entry) => Some(entry.certified_key.clone()),
            None => {
                debug!(sni = %host, "No certificate for SNI host, rejecting handshake");
                record_tls_handshake_failure("unknown_sni");
                None
            }
        }
    }
}

/// Build the TLS listener configuration backed by the routing table
pub fn build_server_config(table: Arc<RoutingTable>) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SnapshotCertResolver::new(table)));
    config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
    Ok(Arc::new(config))
}
