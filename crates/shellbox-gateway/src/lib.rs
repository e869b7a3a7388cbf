//! shellbox-gateway: HTTP front end for sandboxed execution
//!
//! `POST /execute` runs one command through the execution service and records
//! the exchange in the history store; `GET /health` reports liveness.

pub mod protocol;
pub mod server;

pub use server::GatewayServer;
