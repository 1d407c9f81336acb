//! Self-signed certificates for TLS scenarios

use portico::apis::cluster::SecretData;

/// Certificate material for one set of hosts
pub struct TestCertificate {
    /// Secret contents as stored in the cluster
    pub secret: SecretData,
    /// Certificate PEM, for the client's trust store
    pub cert_pem: String,
}

/// Generate a self-signed certificate valid for `hosts`
pub fn self_signed(hosts: &[&str]) -> TestCertificate {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(names).expect("certificate generation");
    let cert_pem = cert.pem();
    TestCertificate {
        secret: SecretData {
            cert_pem: cert_pem.clone().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
        },
        cert_pem,
    }
}
