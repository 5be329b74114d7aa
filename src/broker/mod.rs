//! The `broker` module is a small in-memory broker speaking the session
//! frame protocol. It backs the test suite and local development; it is not
//! meant to run in production.
//!
//! - `Broker` holds all state and handles frames synchronously.
//! - `LoopbackConnector` connects sessions to a shared broker in process.
//! - `websocket::serve` exposes a shared broker over WebSocket.
//!
//! Test hooks such as `drop_connections`, `set_reachable` and `restart`
//! simulate outages.

pub mod client;
pub mod engine;
pub mod filter;
pub mod loopback;
pub mod topic;
pub mod view;
pub mod websocket;

pub use engine::Broker;
pub use filter::Filter;
pub use loopback::{LoopbackConnector, SharedBroker, lock};

use std::sync::{Arc, Mutex};

/// Wraps a broker for sharing between connections.
pub fn shared(broker: Broker) -> SharedBroker {
    Arc::new(Mutex::new(broker))
}
