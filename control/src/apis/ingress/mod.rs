//! Kubernetes Ingress support (networking.k8s.io/v1)
//!
//! - ingress: ClusterApi implementation over Ingress, Secret and Service
//! - watch: add/update/delete classification of watcher events

#[allow(clippy::module_inception)]
pub mod ingress;
pub mod watch;
