//! Routing resources and services for scenarios

use chrono::Utc;
use common::{PathMatch, ResourceKey};
use portico::apis::cluster::{
    BackendPort, BackendRef, RoutingPath, RoutingResource, RoutingRule, ServiceAddress,
    ServicePort, TlsBinding,
};

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_CLASS: &str = "portico";

/// Loopback service exposing `port` as "http"
pub fn loopback_service(port: u16) -> ServiceAddress {
    ServiceAddress {
        cluster_ip: "127.0.0.1".parse().expect("loopback address"),
        ports: vec![ServicePort {
            name: Some("http".to_string()),
            port,
        }],
    }
}

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new(TEST_NAMESPACE, name)
}

/// Builder for routing resources in the test namespace
pub struct Ingress {
    resource: RoutingResource,
}

impl Ingress {
    pub fn new(name: &str) -> Self {
        let mut resource = RoutingResource::new(key(name));
        resource.ingress_class = Some(TEST_CLASS.to_string());
        resource.last_modified = Utc::now();
        Self { resource }
    }

    pub fn class(mut self, class: &str) -> Self {
        self.resource.ingress_class = Some(class.to_string());
        self
    }

    /// Prefix route to `service` on a numbered port
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
