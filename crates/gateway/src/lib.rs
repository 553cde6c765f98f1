//! Gateway: local WebSocket server, frame protocol dispatch, presence and
//! dedupe registries.
//!
//! Lifecycle:
//! 1. Read configuration from the environment
//! 2. Bind the loopback listener
//! 3. Attach the WebSocket upgrade handler
//! 4. Start the tick, dedupe-sweep, and agent-bus pump tasks
//! 5. On shutdown, broadcast a `shutdown` event and close every socket
//!
//! Domain logic (agent runtime, message delivery, health probing) lives
//! behind the collaborator ports in `services.rs` and is invoked through
//! method handlers registered in `methods/`.

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod dedupe;
pub mod methods;
pub mod presence;
pub mod server;
pub mod services;
pub mod state;
pub mod ws;
