//! Ingress reconciler
//!
//! Every event triggers a full relist: the routing table is rebuilt from all
//! resources of our class, conflicts are settled across resources, and the
//! result is published as one snapshot. Status is then written back onto the
//! resource that triggered the event.

use crate::apis::cluster::{ClusterApi, RoutingResource, ServiceAddress, StatusAddress};
use crate::apis::metrics::{record_reconciliation, record_snapshot};
use crate::config::ControllerConfig;
use crate::controller::queue::Event;
use crate::controller::worker::Reconcile;
use crate::error::{ClusterError, ReconcileError};
use crate::proxy::router::{Route, RouteBackend, RoutingTable, RoutingTableSnapshot};
use crate::proxy::tls::{CertificateEntry, TlsCertificate};
use async_trait::async_trait;
use common::{normalize_host, validate_hostname, validate_path, PathMatch, ResourceKey};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    table: Arc<RoutingTable>,
    ingress_class: String,
    status_addresses: Vec<StatusAddress>,
    api_timeout: Duration,
    generation: AtomicU64,
}

/// Newest resource first, ties settled by key
fn precedence(a: &RoutingResource, b: &RoutingResource) -> Ordering {
    b.last_modified
        .cmp(&a.last_modified)
        .then_with(|| a.key.cmp(&b.key))
}

impl Reconciler {
    pub fn new(api: Arc<dyn ClusterApi>, table: Arc<RoutingTable>, config: &ControllerConfig) -> Self {
        Self {
            api,
            table,
            ingress_class: config.ingress_class.clone(),
            status_addresses: config
                .status_addresses
                .iter()
                .map(|address| StatusAddress::parse(address))
                .collect(),
            api_timeout: config.timeouts.api_timeout(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Bound a collaborator call by the API deadline
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, ClusterError>>,
    ) -> Result<T, ClusterError> {
        match tokio::time::timeout(self.api_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout {
                operation,
                timeout: self.api_timeout,
            }),
        }
    }

    async fn run(&self, event: &Event) -> Result<(), ReconcileError> {
        // Taken before listing so a slower, older relist can never win
        let generation = self.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;

        let resources = self
            .call("list_routing_resources", self.api.list_routing_resources())
            .await
            .map_err(ReconcileError::List)?;

        let total = resources.len();
        let mut managed: Vec<RoutingResource> = resources
            .into_iter()
            .filter(|resource| {
                let ours = resource.matches_class(&self.ingress_class);
                if !ours {
                    debug!(
                        resource = %resource.key,
                        class = ?resource.ingress_class,
                        "Ignoring resource of another ingress class"
                    );
                }
                ours
            })
            .collect();
        managed.sort_by(precedence);

        let certificates = self.build_certificates(&managed).await;
        let tls_hosts: HashSet<String> = certificates
            .iter()
            .map(|entry| entry.sni_host.clone())
            .collect();

        let mut routes = self.build_routes(&managed).await?;
        for route in &mut routes {
            route.requires_tls = tls_hosts.contains(&route.host);
        }

        let route_count = routes.len();
        let certificate_count = certificates.len();
        let snapshot = RoutingTableSnapshot::new(generation, routes, certificates);
        if self.table.publish(snapshot) {
            record_snapshot(route_count, certificate_count);
            info!(
                generation,
                trigger = %event.key,
                resources = managed.len(),
                ignored = total - managed.len(),
                routes = route_count,
                certificates = certificate_count,
                "Published routing table"
            );
        }

        self.update_status(&event.key).await
    }

    /// Route candidates of every managed resource, conflicts resolved
    async fn build_routes(&self, managed: &[RoutingResource]) -> Result<Vec<Route>, ReconcileError> {
        let mut services: HashMap<ResourceKey, Option<ServiceAddress>> = HashMap::new();
        let mut claims: HashMap<(String, String, PathMatch), ResourceKey> = HashMap::new();
        let mut routes = Vec::new();

        for resource in managed {
            for rule in &resource.rules {
                let host = rule.host.as_deref().map(normalize_host).unwrap_or_default();
                if !host.is_empty() {
                    if let Err(reason) = validate_hostname(&host) {
                        warn!(resource = %resource.key, host = %host, reason = %reason, "Skipping rule with invalid host");
                        continue;
                    }
                }

                for path in &rule.paths {
                    if let Err(reason) = validate_path(&path.path) {
                        warn!(resource = %resource.key, path = %path.path, reason = %reason, "Skipping invalid path");
                        continue;
                    }
                    let Some(backend) = &path.backend else {
                        warn!(resource = %resource.key, path = %path.path, "Skipping path without a service backend");
                        continue;
                    };

                    let claim = (host.clone(), path.path.clone(), path.path_match);
                    if let Some(owner) = claims.get(&claim) {
                        if owner != &resource.key {
                            warn!(
                                host = %host,
                                path = %path.path,
                                winner = %owner,
                                loser = %resource.key,
                                "Conflicting route, keeping the most recently modified resource"
                            );
                        }
                        continue;
                    }

                    let service_key = ResourceKey::new(resource.key.namespace.clone(), backend.service.clone());
                    let address = match services.get(&service_key) {
                        Some(cached) => cached.clone(),
                        None => {
                            let resolved = self.resolve_service(&service_key).await?;
                            services.insert(service_key.clone(), resolved.clone());
                            resolved
                        }
                    };
                    let Some(address) = address else {
                        continue;
                    };
                    if address.resolve_port(&backend.port).is_none() {
                        warn!(
                            resource = %resource.key,
                            service = %service_key,
                            port = %backend.port,
                            "Service has no such port, skipping route"
                        );
                        continue;
                    }

                    claims.insert(claim, resource.key.clone());
                    routes.push(Route {
                        host: host.clone(),
                        path: path.path.clone(),
                        path_match: path.path_match,
                        backend: RouteBackend {
                            namespace: resource.key.namespace.clone(),
                            service: backend.service.clone(),
                            port: backend.port.clone(),
                        },
                        requires_tls: false,
                        ingress_class: self.ingress_class.clone(),
                        source: resource.key.clone(),
                    });
                }
            }
        }

        Ok(routes)
    }

    /// Look up a backend service; `None` excludes the routes pointing at it
    async fn resolve_service(&self, key: &ResourceKey) -> Result<Option<ServiceAddress>, ReconcileError> {
        let lookup = self
            .call(
                "get_service_cluster_address",
                self.api.get_service_cluster_address(&key.namespace, &key.name),
            )
            .await;

        match lookup {
            Ok(address) => Ok(Some(address)),
            Err(e @ (ClusterError::NotFound { .. } | ClusterError::InvalidData { .. })) => {
                warn!(service = %key, error = %e, "Backend service unusable, excluding its routes");
                Ok(None)
            }
            Err(source) => Err(ReconcileError::Backend {
                service: key.to_string(),
                source,
            }),
        }
    }

    /// Certificates for every TLS host; failures only degrade that host
    async fn build_certificates(&self, managed: &[RoutingResource]) -> Vec<CertificateEntry> {
        let mut parsed: HashMap<ResourceKey, Option<CertificateEntry>> = HashMap::new();
        let mut owners: HashMap<String, ResourceKey> = HashMap::new();
        let mut entries = Vec::new();

        for resource in managed {
            for binding in &resource.tls {
                let Some(secret_name) = binding.secret_name.as_deref().filter(|s| !s.is_empty()) else {
                    debug!(resource = %resource.key, "TLS block without a secret, skipping");
                    continue;
                };
                let secret_key = ResourceKey::new(resource.key.namespace.clone(), secret_name);

                for raw_host in &binding.hosts {
                    let host = normalize_host(raw_host);
                    if host.is_empty() {
                        continue;
                    }
                    if let Some(owner) = owners.get(&host) {
                        if owner != &resource.key {
                            warn!(
                                host = %host,
                                winner = %owner,
                                loser = %resource.key,
                                "Conflicting TLS host, keeping the most recently modified resource"
                            );
                        }
                        continue;
                    }

                    if !parsed.contains_key(&secret_key) {
                        let entry = self.load_certificate(&host, &secret_key).await;
                        parsed.insert(secret_key.clone(), entry);
                    }
                    let Some(Some(template)) = parsed.get(&secret_key) else {
                        continue;
                    };

                    owners.insert(host.clone(), resource.key.clone());
                    entries.push(template.for_host(&host));
                }
            }
        }

        entries
    }

    async fn load_certificate(&self, host: &str, secret: &ResourceKey) -> Option<CertificateEntry> {
        let data = match self
            .call("get_secret", self.api.get_secret(&secret.namespace, &secret.name))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(secret = %secret, host = %host, error = %e, "Failed to fetch TLS secret, host will not serve TLS");
                return None;
            }
        };

        let loaded = TlsCertificate::from_pem(&data.cert_pem, &data.key_pem)
            .and_then(|certificate| CertificateEntry::new(host, &certificate, secret.clone()));
        match loaded {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(secret = %secret, host = %host, error = %e, "Invalid TLS secret, host will not serve TLS");
                None
            }
        }
    }

    /// Report the configured addresses on the keyed resource
    async fn update_status(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let resource = match self
            .call("get_routing_resource", self.api.get_routing_resource(key))
            .await
        {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "Resource gone, no status to report");
                return Ok(());
            }
            Err(source) => {
                return Err(ReconcileError::Status {
                    key: key.clone(),
                    source,
                })
            }
        };

        if !resource.matches_class(&self.ingress_class) {
            return Ok(());
        }
        if resource.status_addresses == self.status_addresses {
            debug!(resource = %key, "Status already up to date");
            return Ok(());
        }

        self.call(
            "update_routing_resource_status",
            self.api
                .update_routing_resource_status(key, &self.status_addresses),
        )
        .await
        .map_err(|source| ReconcileError::Status {
            key: key.clone(),
            source,
        })?;

        info!(
            resource = %key,
            addresses = ?self.status_addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Updated load balancer status"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, event: &Event) -> Result<(), ReconcileError> {
        let started = Instant::now();
        let result = self.run(event).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        record_reconciliation(started.elapsed().as_secs_f64(), outcome);
        result
    }
}
