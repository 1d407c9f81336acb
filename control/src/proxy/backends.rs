//! Backend address resolution
//!
//! Routes name a service and port; the proxy needs a socket address. Lookups
//! go through the cluster API and are cached for a short TTL so a busy host
//! does not turn every request into an API call.

use crate::apis::cluster::{ClusterApi, ServiceAddress};
use crate::error::{ClusterError, ProxyError};
use crate::proxy::router::RouteBackend;
use common::ResourceKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned in backend resolver, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned in backend resolver, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

struct CachedService {
    address: ServiceAddress,
    fetched_at: Instant,
}

pub struct BackendResolver {
    api: Arc<dyn ClusterApi>,
    /// Zero disables caching
    ttl: Duration,
    timeout: Duration,
    cache: RwLock<HashMap<ResourceKey, CachedService>>,
}

impl BackendResolver {
    pub fn new(api: Arc<dyn ClusterApi>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            api,
            ttl,
            timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Socket address for a route backend
    pub async fn resolve(&self, backend: &RouteBackend) -> Result<SocketAddr, ProxyError> {
        let key = ResourceKey::new(backend.namespace.clone(), backend.service.clone());
        let address = self.service_address(&key).await?;

        let port = address.resolve_port(&backend.port).ok_or_else(|| {
            ProxyError::BackendUnavailable(ClusterError::invalid(
                "service",
                &key,
                format!("no port {}", backend.port),
            ))
        })?;

        Ok(SocketAddr::new(address.cluster_ip, port))
    }

    async fn service_address(&self, key: &ResourceKey) -> Result<ServiceAddress, ProxyError> {
        if !self.ttl.is_zero() {
            let cache = safe_read(&self.cache);
            if let Some(cached) = cache.get(key) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.address.clone());
                }
            }
        }

        let lookup = tokio::time::timeout(
            self.timeout,
            self.api.get_service_cluster_address(&key.namespace, &key.name),
        )
        .await
        .unwrap_or(Err(ClusterError::Timeout {
            operation: "get_service_cluster_address",
            timeout: self.timeout,
        }));

        match lookup {
            Ok(address) => {
                debug!(service = %key, ip = %address.cluster_ip, "Resolved backend service");
                if !self.ttl.is_zero() {
                    let mut cache = safe_write(&self.cache);
                    // Drop entries past their TTL
                    cache.retain(|_, cached| cached.fetched_at.elapsed() < self.ttl);
                    cache.insert(
                        key.clone(),
                        CachedService {
                            address: address.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Ok(address)
            }
            Err(e) => {
                safe_write(&self.cache).remove(key);
                Err(ProxyError::BackendUnavailable(e))
            }
        }
    }

    pub fn cached_services(&self) -> usize {
        safe_read(&self.cache).len()
    }
}
