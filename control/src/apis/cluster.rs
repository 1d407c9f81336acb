//! Cluster API collaborator
//!
//! Everything the controller needs from the cluster, expressed over plain
//! routing types so the reconciler never sees Kubernetes objects directly.

use crate::error::ClusterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventKind, PathMatch, ResourceKey};
use futures::stream::BoxStream;
use std::fmt;
use std::net::IpAddr;

/// Port of a backend service, by number or by service port name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendPort {
    Number(u16),
    Name(String),
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPort::Number(port) => write!(f, "{}", port),
            BackendPort::Name(name) => f.write_str(name),
        }
    }
}

/// Service referenced by a rule path (same namespace as the resource)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendRef {
    pub service: String,
    pub port: BackendPort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPath {
    pub path: String,
    pub path_match: PathMatch,
    /// None when the path points at something other than a service
    pub backend: Option<BackendRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRule {
    /// None for catch-all rules
    pub host: Option<String>,
    pub paths: Vec<RoutingPath>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsBinding {
    pub hosts: Vec<String>,
    pub secret_name: Option<String>,
}

/// Address reported in a resource's load-balancer status
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusAddress {
    Ip(IpAddr),
    Hostname(String),
}

impl StatusAddress {
    pub fn parse(value: &str) -> Self {
        match value.parse::<IpAddr>() {
            Ok(ip) => StatusAddress::Ip(ip),
            Err(_) => StatusAddress::Hostname(value.to_string()),
        }
    }
}

impl fmt::Display for StatusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusAddress::Ip(ip) => write!(f, "{}", ip),
            StatusAddress::Hostname(host) => f.write_str(host),
        }
    }
}

/// Desired routing state declared by one routing-intent resource
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingResource {
    pub key: ResourceKey,
    pub ingress_class: Option<String>,
    /// Most recent modification, used to settle host/path conflicts
    pub last_modified: DateTime<Utc>,
    pub rules: Vec<RoutingRule>,
    pub tls: Vec<TlsBinding>,
    /// Addresses currently reported in status
    pub status_addresses: Vec<StatusAddress>,
}

impl RoutingResource {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            ingress_class: None,
            last_modified: DateTime::<Utc>::default(),
            rules: Vec::new(),
            tls: Vec::new(),
            status_addresses: Vec::new(),
        }
    }

    pub fn matches_class(&self, class: &str) -> bool {
        self.ingress_class.as_deref() == Some(class)
    }
}

/// Certificate chain and private key from a TLS secret (PEM)
#[derive(Clone)]
pub struct SecretData {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl fmt::Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretData")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
}

/// Cluster-internal address of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub cluster_ip: IpAddr,
    pub ports: Vec<ServicePort>,
}

impl ServiceAddress {
    /// Resolve a backend port against the service's declared ports
    ///
    /// Numbered ports are used as-is (matching the proxy's pass-through of
    /// the declared port); named ports must exist on the service.
    pub fn resolve_port(&self, port: &BackendPort) -> Option<u16> {
        match port {
            BackendPort::Number(number) => Some(*number),
            BackendPort::Name(name) => self
                .ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .map(|p| p.port),
        }
    }
}

/// A change notification from the watch subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: ResourceKey,
}

impl WatchEvent {
    pub fn new(kind: EventKind, key: ResourceKey) -> Self {
        Self { kind, key }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;

/// Cluster API collaborator
///
/// Callers bound every call with their own deadline; implementations only
/// need to report failures.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_routing_resources(&self) -> Result<Vec<RoutingResource>, ClusterError>;

    async fn get_routing_resource(&self, key: &ResourceKey)
        -> Result<RoutingResource, ClusterError>;

    async fn update_routing_resource_status(
        &self,
        key: &ResourceKey,
        addresses: &[StatusAddress],
    ) -> Result<(), ClusterError>;

    fn watch_routing_resources(&self) -> WatchStream;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData, ClusterError>;

    async fn get_service_cluster_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAddress, ClusterError>;
}
