//! Network plumbing
//!
//! - [`retry`]: low-level retry-with-backoff against a single endpoint
//! - [`gateway`]: plain HTTP GET/HEAD against public gateways
//! - [`daemon`]: RPC client for the local daemon
//!
//! Retries here are a transport concern only. Competition between backends
//! lives in the resolver.

pub mod daemon;
pub mod gateway;
pub mod retry;

pub use daemon::{DaemonClient, DaemonEndpoint};
pub use gateway::{GatewayClient, GatewayRequest, GatewayResponse, HttpGateway, Method};
pub use retry::{with_retry, RetryPolicy};
