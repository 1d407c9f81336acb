//! Portico ingress controller
//!
//! Watches routing-intent resources, reconciles them into an immutable
//! routing and certificate snapshot, and serves that snapshot from an HTTP
//! redirect listener and a TLS reverse proxy.

pub mod apis;
pub mod config;
pub mod controller;
pub mod error;
pub mod proxy;

#[cfg(test)]
mod test_support;
