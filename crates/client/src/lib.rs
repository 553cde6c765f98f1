//! Loopback client for the clawdis gateway.
//!
//! Opens a WebSocket to the gateway, performs the `hello`/`hello-ok`
//! handshake, and then multiplexes RPC requests and server-push events over
//! the single connection. Reconnects automatically with exponential backoff;
//! detects gaps in the broadcast sequence so consumers can resynchronize.

mod connection;
mod error;

pub use {
    connection::{ClientEvent, ClientOptions, GatewayClient, RequestOpts},
    error::{Error, Result},
};
