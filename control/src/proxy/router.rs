//! Routing table
//!
//! The reconciler builds an immutable `RoutingTableSnapshot` from a full
//! relist and publishes it with a single pointer swap. Request handlers load
//! whichever snapshot is current without taking a lock and keep it alive for
//! the rest of the request, so a reader never mixes routes from two
//! snapshots.
//!
//! Matching order for a request host:
//! 1. routes whose host equals the request host
//! 2. wildcard routes (`*` matches exactly one label)
//! 3. host-less (catch-all) routes
//!
//! Within a tier the first route whose path matches wins. Routes are stored
//! longest path first, then most specific host, then Exact before Prefix,
//! which makes matching deterministic for a given snapshot.

use crate::apis::cluster::BackendPort;
use crate::proxy::tls::CertificateEntry;
use arc_swap::ArcSwap;
use common::{host_matches, path_matches, path_specificity, HostKind, PathMatch, ResourceKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[inline]
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned in routing table, recovering (data is still valid)");
        poisoned.into_inner()
    })
}

/// Backend service a route forwards to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteBackend {
    pub namespace: String,
    pub service: String,
    pub port: BackendPort,
}

impl fmt::Display for RouteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.service, self.port)
    }
}

/// One host+path rule of one routing resource
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Lowercase host, may contain `*` labels; empty matches any host
    pub host: String,
    pub path: String,
    pub path_match: PathMatch,
    pub backend: RouteBackend,
    /// A certificate for this host is present in the same snapshot
    pub requires_tls: bool,
    pub ingress_class: String,
    /// Routing resource the route was derived from
    pub source: ResourceKey,
}

impl Route {
    pub fn host_kind(&self) -> HostKind {
        HostKind::of(&self.host)
    }

    pub fn matches_path(&self, path: &str) -> bool {
        path_matches(self.path_match, &self.path, path)
    }

    /// Sort key: longest path, then host specificity, then Exact first.
    /// Host, path and source make the order total.
    fn order_key(&self) -> (std::cmp::Reverse<usize>, HostKind, PathMatch, &str, &str, &ResourceKey) {
        (
            std::cmp::Reverse(path_specificity(&self.path)),
            self.host_kind(),
            self.path_match,
            &self.host,
            &self.path,
            &self.source,
        )
    }
}

/// Immutable routing and certificate state
#[derive(Debug, Default)]
pub struct RoutingTableSnapshot {
    generation: u64,
    routes: Vec<Route>,
    /// Exact host -> route indexes, in route order
    exact_hosts: HashMap<String, Vec<usize>>,
    wildcard_routes: Vec<usize>,
    catch_all_routes: Vec<usize>,
    certificates: HashMap<String, Arc<CertificateEntry>>,
}

impl RoutingTableSnapshot {
    /// Build a snapshot, ordering routes and indexing hosts
    ///
    /// Later certificates for an SNI host already present are ignored;
    /// callers resolve conflicts before building.
    pub fn new(generation: u64, mut routes: Vec<Route>, certificates: Vec<CertificateEntry>) -> Self {
        routes.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let mut exact_hosts: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard_routes = Vec::new();
        let mut catch_all_routes = Vec::new();
        for (index, route) in routes.iter().enumerate() {
            match route.host_kind() {
                HostKind::Exact => exact_hosts.entry(route.host.clone()).or_default().push(index),
                HostKind::Wildcard => wildcard_routes.push(index),
                HostKind::Any => catch_all_routes.push(index),
            }
        }

        let mut by_host = HashMap::with_capacity(certificates.len());
        for entry in certificates {
            by_host
                .entry(entry.sni_host.clone())
                .or_insert_with(|| Arc::new(entry));
        }

        Self {
            generation,
            routes,
            exact_hosts,
            wildcard_routes,
            catch_all_routes,
            certificates: by_host,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Routes in match order
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates.len()
    }

    /// Find the route for a normalized request host and path
    pub fn match_route(&self, host: &str, path: &str) -> Option<&Route> {
        let exact = self
            .exact_hosts
            .get(host)
            .into_iter()
            .flatten()
            .map(|&i| &self.routes[i])
            .find(|route| route.matches_path(path));
        if exact.is_some() {
            return exact;
        }

        let wildcard = self
            .wildcard_routes
            .iter()
            .map(|&i| &self.routes[i])
            .find(|route| host_matches(&route.host, host) && route.matches_path(path));
        if wildcard.is_some() {
            return wildcard;
        }

        self.catch_all_routes
            .iter()
            .map(|&i| &self.routes[i])
            .find(|route| route.matches_path(path))
    }

    /// Certificate for an SNI host name (exact match only)
    pub fn certificate_for(&self, sni_host: &str) -> Option<&Arc<CertificateEntry>> {
        self.certificates.get(sni_host)
    }
}

/// Shared, swappable routing table
///
/// `current` never blocks: readers get the snapshot that was current when
/// they asked, even while a publish is in progress.
pub struct RoutingTable {
    current: ArcSwap<RoutingTableSnapshot>,
    publish_lock: Mutex<()>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RoutingTableSnapshot::empty()),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<RoutingTableSnapshot> {
        self.current.load_full()
    }

    /// Install `snapshot` if it is newer than the published one
    ///
    /// Returns false (and keeps the current table) for a stale generation,
    /// so a slow reconciliation can never roll back a newer relist.
    pub fn publish(&self, snapshot: RoutingTableSnapshot) -> bool {
        let _guard = safe_lock(&self.publish_lock);
        let published = self.current.load().generation;
        if snapshot.generation <= published {
            debug!(
                generation = snapshot.generation,
                published, "Skipping stale routing snapshot"
            );
            return false;
        }
        debug!(
            generation = snapshot.generation,
            routes = snapshot.routes.len(),
            certificates = snapshot.certificates.len(),
            "Publishing routing snapshot"
        );
        self.current.store(Arc::new(snapshot));
        true
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("generation", &self.current.load().generation)
            .finish()
    }
}
