//! HTTP ingress: the pairing exchange, the bearer-protected webhook, and a
//! liveness probe.

pub mod auth_middleware;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use {
    error::ApiError,
    server::{GatewayServer, build_gateway_app},
    state::GatewayState,
};
