//! In-process cluster
//!
//! A complete `ClusterApi` backed by maps. Mutations are broadcast to
//! watchers the same way the API server would notify them, and failures or
//! latency can be injected to exercise retry and deadline handling.

use crate::apis::cluster::{
    ClusterApi, RoutingResource, SecretData, ServiceAddress, StatusAddress, WatchEvent,
    WatchStream,
};
use crate::error::ClusterError;
use async_trait::async_trait;
use common::{EventKind, ResourceKey};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[inline]
fn safe_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned in in-memory cluster, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[inline]
fn safe_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock poisoned in in-memory cluster, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

#[derive(Default)]
struct State {
    resources: BTreeMap<ResourceKey, RoutingResource>,
    secrets: BTreeMap<ResourceKey, SecretData>,
    services: BTreeMap<ResourceKey, ServiceAddress>,
}

#[derive(Default)]
struct Faults {
    failing_lists: usize,
    failing_status_updates: usize,
    failing_service_lookups: usize,
    call_delay: Option<Duration>,
}

pub struct InMemoryCluster {
    state: RwLock<State>,
    faults: RwLock<Faults>,
    events: broadcast::Sender<WatchEvent>,
    status_updates: AtomicUsize,
    service_lookups: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            faults: RwLock::new(Faults::default()),
            events,
            status_updates: AtomicUsize::new(0),
            service_lookups: AtomicUsize::new(0),
        }
    }

    /// Create or replace a routing resource, notifying watchers
    pub fn apply_resource(&self, resource: RoutingResource) {
        let key = resource.key.clone();
        let previous = safe_write(&self.state)
            .resources
            .insert(key.clone(), resource);
        let kind = if previous.is_some() {
            EventKind::Update
        } else {
            EventKind::Add
        };
        self.notify(kind, key);
    }

    pub fn delete_resource(&self, key: &ResourceKey) -> bool {
        let removed = safe_write(&self.state).resources.remove(key).is_some();
        if removed {
            self.notify(EventKind::Delete, key.clone());
        }
        removed
    }

    pub fn resource(&self, key: &ResourceKey) -> Option<RoutingResource> {
        safe_read(&self.state).resources.get(key).cloned()
    }

    pub fn set_secret(&self, namespace: &str, name: &str, data: SecretData) {
        safe_write(&self.state)
            .secrets
            .insert(ResourceKey::new(namespace, name), data);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        safe_write(&self.state)
            .secrets
            .remove(&ResourceKey::new(namespace, name));
    }

    pub fn set_service(&self, namespace: &str, name: &str, address: ServiceAddress) {
        safe_write(&self.state)
            .services
            .insert(ResourceKey::new(namespace, name), address);
    }

    pub fn remove_service(&self, namespace: &str, name: &str) {
        safe_write(&self.state)
            .services
            .remove(&ResourceKey::new(namespace, name));
    }

    /// Make the next `count` list calls fail with an API error
    pub fn fail_next_lists(&self, count: usize) {
        safe_write(&self.faults).failing_lists = count;
    }

    /// Make the next `count` status updates fail with an API error
    pub fn fail_next_status_updates(&self, count: usize) {
        safe_write(&self.faults).failing_status_updates = count;
    }

    /// Make the next `count` service lookups fail with an API error
    pub fn fail_next_service_lookups(&self, count: usize) {
        safe_write(&self.faults).failing_service_lookups = count;
    }

    /// Delay every API call (not watch delivery) by `delay`
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        safe_write(&self.faults).call_delay = delay;
    }

    pub fn status_update_count(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    pub fn service_lookup_count(&self) -> usize {
        self.service_lookups.load(Ordering::SeqCst)
    }

    fn notify(&self, kind: EventKind, key: ResourceKey) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(WatchEvent::new(kind, key));
    }

    async fn simulate_latency(&self) {
        let delay = safe_read(&self.faults).call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn take_fault(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_routing_resources(&self) -> Result<Vec<RoutingResource>, ClusterError> {
        self.simulate_latency().await;
        if Self::take_fault(&mut safe_write(&self.faults).failing_lists) {
            return Err(ClusterError::Api("injected list failure".to_string()));
        }
        Ok(safe_read(&self.state).resources.values().cloned().collect())
    }

    async fn get_routing_resource(
        &self,
        key: &ResourceKey,
    ) -> Result<RoutingResource, ClusterError> {
        self.simulate_latency().await;
        safe_read(&self.state)
            .resources
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("ingress", key))
    }

    async fn update_routing_resource_status(
        &self,
        key: &ResourceKey,
        addresses: &[StatusAddress],
    ) -> Result<(), ClusterError> {
        self.simulate_latency().await;
        if Self::take_fault(&mut safe_write(&self.faults).failing_status_updates) {
            return Err(ClusterError::Api("injected status update failure".to_string()));
        }
        {
            let mut state = safe_write(&self.state);
            let resource = state
                .resources
                .get_mut(key)
                .ok_or_else(|| ClusterError::not_found("ingress", key))?;
            resource.status_addresses = addresses.to_vec();
        }
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        self.notify(EventKind::Update, key.clone());
        Ok(())
    }

    fn watch_routing_resources(&self) -> WatchStream {
        // Subscribe before listing so nothing applied in between is missed
        let receiver = self.events.subscribe();
        let initial: Vec<Result<WatchEvent, ClusterError>> = safe_read(&self.state)
            .resources
            .keys()
            .map(|key| Ok(WatchEvent::new(EventKind::Add, key.clone())))
            .collect();

        let live = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(event), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        futures::stream::iter(initial).chain(live).boxed()
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretData, ClusterError> {
        self.simulate_latency().await;
        let key = ResourceKey::new(namespace, name);
        safe_read(&self.state)
            .secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("secret", key))
    }

    async fn get_service_cluster_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAddress, ClusterError> {
        self.simulate_latency().await;
        self.service_lookups.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&mut safe_write(&self.faults).failing_service_lookups) {
            return Err(ClusterError::Api("injected service lookup failure".to_string()));
        }
        let key = ResourceKey::new(namespace, name);
        safe_read(&self.state)
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::not_found("service", key))
    }
}
