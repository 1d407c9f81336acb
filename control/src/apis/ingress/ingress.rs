//! Kubernetes-backed cluster API
//!
//! Translates `networking.k8s.io/v1` Ingress objects into routing resources,
//! reads TLS secrets and service cluster IPs, and writes the load-balancer
//! status back onto Ingresses.

use crate::apis::cluster::{
    BackendPort, BackendRef, ClusterApi, RoutingPath, RoutingResource, RoutingRule, SecretData,
    ServiceAddress, ServicePort, StatusAddress, TlsBinding, WatchStream,
};
use crate::apis::ingress::watch::{key_of, WatchClassifier};
use crate::error::ClusterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PathMatch, ResourceKey};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressBackend};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde_json::json;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Legacy class selector, still widely used alongside `spec.ingressClassName`
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

const FIELD_MANAGER: &str = "portico-controller";

/// ClusterApi over a live Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn api_error(err: kube::Error) -> ClusterError {
    ClusterError::Api(err.to_string())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_routing_resources(&self) -> Result<Vec<RoutingResource>, ClusterError> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await.map_err(api_error)?;
        Ok(list.items.iter().map(ingress_to_resource).collect())
    }

    async fn get_routing_resource(
        &self,
        key: &ResourceKey,
    ) -> Result<RoutingResource, ClusterError> {
        self.ingresses(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(api_error)?
            .map(|ingress| ingress_to_resource(&ingress))
            .ok_or_else(|| ClusterError::not_found("ingress", key))
    }

    async fn update_routing_resource_status(
        &self,
        key: &ResourceKey,
        addresses: &[StatusAddress],
    ) -> Result<(), ClusterError> {
        let status = status_patch(addresses);
        match self
            .ingresses(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status),
            )
            .await
        {
            Ok(_) => {
                info!(key = %key, addresses = addresses.len(), "Updated Ingress status");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(ClusterError::not_found("ingress", key))
            }
            Err(e) => Err(api_error(e)),
        }
    }

    fn watch_routing_resources(&self) -> WatchStream {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let mut classifier = WatchClassifier::new();

        watcher(api, WatcherConfig::default())
            .default_backoff()
            .map(move |event| match event {
                Ok(event) => classifier
                    .classify(event)
                    .into_iter()
                    .map(Ok)
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(ClusterError::Api(e.to_string()))],
            })
            .flat_map(futures::stream::iter)
            .boxed()
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| ClusterError::not_found("secret", format!("{}/{}", namespace, name)))?;
        secret_to_data(&secret)
    }

    async fn get_service_cluster_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAddress, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await
            .map_err(api_error)?
            .ok_or_else(|| {
                ClusterError::not_found("service", format!("{}/{}", namespace, name))
            })?;
        service_to_address(&service)
    }
}

/// Build the merge patch for `status.loadBalancer.ingress`
pub fn status_patch(addresses: &[StatusAddress]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = addresses
        .iter()
        .map(|address| match address {
            StatusAddress::Ip(ip) => json!({ "ip": ip.to_string() }),
            StatusAddress::Hostname(host) => json!({ "hostname": host }),
        })
        .collect();

    json!({
        "status": {
            "loadBalancer": {
                "ingress": entries
            }
        }
    })
}

/// Translate an Ingress into the controller's routing model
pub fn ingress_to_resource(ingress: &Ingress) -> RoutingResource {
    let key = key_of(ingress);
    let mut resource = RoutingResource::new(key.clone());
    resource.last_modified = last_modified(ingress);

    let spec = match &ingress.spec {
        Some(spec) => spec,
        None => return resource,
    };

    resource.ingress_class = spec.ingress_class_name.clone().or_else(|| {
        ingress
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION).cloned())
    });

    for rule in spec.rules.iter().flatten() {
        let paths = rule
            .http
            .as_ref()
            .map(|http| http.paths.iter().map(translate_path).collect())
            .unwrap_or_default();
        resource.rules.push(RoutingRule {
            host: rule.host.clone().filter(|h| !h.is_empty()),
            paths,
        });
    }

    // The default backend behaves like a host-less "/" rule after all others
    if let Some(default_backend) = &spec.default_backend {
        resource.rules.push(RoutingRule {
            host: None,
            paths: vec![RoutingPath {
                path: "/".to_string(),
                path_match: PathMatch::Prefix,
                backend: translate_backend(default_backend),
            }],
        });
    }

    resource.tls = spec
        .tls
        .iter()
        .flatten()
        .map(|tls| TlsBinding {
            hosts: tls.hosts.clone().unwrap_or_default(),
            secret_name: tls.secret_name.clone().filter(|s| !s.is_empty()),
        })
        .collect();

    resource.status_addresses = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .ip
                        .as_deref()
                        .and_then(|ip| ip.parse::<IpAddr>().ok())
                        .map(StatusAddress::Ip)
                        .or_else(|| entry.hostname.clone().map(StatusAddress::Hostname))
                })
                .collect()
        })
        .unwrap_or_default();

    debug!(
        key = %key,
        class = ?resource.ingress_class,
        rules = resource.rules.len(),
        tls = resource.tls.len(),
        "Translated Ingress"
    );
    resource
}

fn translate_path(path: &HTTPIngressPath) -> RoutingPath {
    let path_match = match path.path_type.as_str() {
        "Exact" => PathMatch::Exact,
        // Prefix and ImplementationSpecific
        _ => PathMatch::Prefix,
    };
    RoutingPath {
        path: path
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string()),
        path_match,
        backend: translate_backend(&path.backend),
    }
}

fn translate_backend(backend: &IngressBackend) -> Option<BackendRef> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref()?;
    let port = match (&port.number, &port.name) {
        (Some(number), _) => BackendPort::Number(u16::try_from(*number).ok()?),
        (None, Some(name)) if !name.is_empty() => BackendPort::Name(name.clone()),
        _ => return None,
    };
    Some(BackendRef {
        service: service.name.clone(),
        port,
    })
}

fn parse_time(time: &Time) -> Option<DateTime<Utc>> {
    // Go through the wire format so this holds whichever time crate backs Time
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Newest managed-field write, falling back to the creation timestamp
fn last_modified(ingress: &Ingress) -> DateTime<Utc> {
    let metadata = &ingress.metadata;
    metadata
        .managed_fields
        .iter()
        .flatten()
        .filter_map(|entry| entry.time.as_ref().and_then(parse_time))
        .max()
        .or_else(|| metadata.creation_timestamp.as_ref().and_then(parse_time))
        .unwrap_or_default()
}

/// Extract the `tls.crt`/`tls.key` pair from a Secret
pub fn secret_to_data(secret: &Secret) -> Result<SecretData, ClusterError> {
    let key = key_of(secret);
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| ClusterError::invalid("secret", &key, "Secret has no data"))?;

    let cert = data
        .get("tls.crt")
        .ok_or_else(|| ClusterError::invalid("secret", &key, "Secret missing tls.crt"))?;
    let private_key = data
        .get("tls.key")
        .ok_or_else(|| ClusterError::invalid("secret", &key, "Secret missing tls.key"))?;

    Ok(SecretData {
        cert_pem: cert.0.clone(),
        key_pem: private_key.0.clone(),
    })
}

/// Extract the cluster IP and ports from a Service
pub fn service_to_address(service: &Service) -> Result<ServiceAddress, ClusterError> {
    let key = key_of(service);
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| ClusterError::invalid("service", &key, "Service has no spec"))?;

    let cluster_ip = match spec.cluster_ip.as_deref() {
        None | Some("") | Some("None") => {
            warn!(service = %key, "Service has no cluster IP (headless)");
            return Err(ClusterError::invalid(
                "service",
                &key,
                "Service has no cluster IP",
            ));
        }
        Some(ip) => ip.parse::<IpAddr>().map_err(|e| {
            ClusterError::invalid("service", &key, format!("invalid cluster IP '{}': {}", ip, e))
        })?,
    };

    let ports = spec
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            u16::try_from(p.port).ok().map(|port| ServicePort {
                name: p.name.clone(),
                port,
            })
        })
        .collect();

    Ok(ServiceAddress { cluster_ip, ports })
}
