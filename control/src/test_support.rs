//! Shared helpers for unit tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::apis::cluster::{
    BackendPort, BackendRef, RoutingPath, RoutingResource, RoutingRule, SecretData,
    ServiceAddress, ServicePort, TlsBinding,
};
use chrono::{DateTime, TimeZone, Utc};
use common::{PathMatch, ResourceKey};
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_crypto() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Self-signed certificate and key for `hosts`, as PEM
pub fn self_signed(hosts: &[&str]) -> SecretData {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(names).expect("certificate generation");
    SecretData {
        cert_pem: cert.pem().into_bytes(),
        key_pem: key_pair.serialize_pem().into_bytes(),
    }
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn service(ip: &str, port: u16) -> ServiceAddress {
    ServiceAddress {
        cluster_ip: ip.parse().unwrap(),
        ports: vec![ServicePort {
            name: Some("http".to_string()),
            port,
        }],
    }
}

/// Builder for routing resources in tests
pub struct ResourceBuilder {
    resource: RoutingResource,
}

impl ResourceBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut resource = RoutingResource::new(ResourceKey::new(namespace, name));
        resource.ingress_class = Some("portico".to_string());
        Self { resource }
    }

    pub fn class(mut self, class: Option<&str>) -> Self {
        self.resource.ingress_class = class.map(String::from);
        self
    }

    pub fn modified(mut self, seconds: i64) -> Self {
        self.resource.last_modified = at(seconds);
        self
    }

    pub fn route(self, host: &str, path: &str, service: &str, port: u16) -> Self {
        self.route_with(host, path, PathMatch::Prefix, service, BackendPort::Number(port))
    }

    pub fn route_with(
        mut self,
        host: &str,
        path: &str,
        path_match: PathMatch,
        service: &str,
        port: BackendPort,
    ) -> Self {
        self.resource.rules.push(RoutingRule {
            host: Some(host.to_string()).filter(|h| !h.is_empty()),
            paths: vec![RoutingPath {
                path: path.to_string(),
                path_match,
                backend: Some(BackendRef {
                    service: service.to_string(),
                    port,
                }),
            }],
        });
        self
    }

    pub fn tls(mut self, hosts: &[&str], secret: &str) -> Self {
        self.resource.tls.push(TlsBinding {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            secret_name: Some(secret.to_string()),
        });
        self
    }

    pub fn build(self) -> RoutingResource {
        self.resource
    }
}
