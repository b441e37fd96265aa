//! Client Access Module
//!
//! Serves the registry protocol to service clients on the node's client port.
//!
//! ## Core Concepts
//! - **Server**: `ClientServer` runs one reader and one writer task per connection and keeps
//!   each connection's outbound queue in `ClientConnections`, which also delivers
//!   service-changed pushes for subscribed connections.
//! - **Processing**: `RequestProcessor` routes each request to the owning registry shard and
//!   forwards successful mutations to the replica holder.
//! - **Connector**: `RegistryClient` speaks the same protocol from the other side.

pub mod connector;
pub mod processor;
pub mod server;
