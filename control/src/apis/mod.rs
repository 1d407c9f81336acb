//! Cluster API integrations
//!
//! The `ClusterApi` collaborator plus its Kubernetes and in-memory
//! implementations.

pub mod cluster;
pub mod ingress;
pub mod memory;
pub mod metrics;
