//! Data plane: routing table, TLS termination and request forwarding

pub mod backends;
pub mod forwarder;
pub mod metrics;
pub mod request_handler;
pub mod router;
pub mod server;
pub mod tls;
