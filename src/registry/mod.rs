//! Service Registry Module
//!
//! Holds the service instances owned by this node, one shard per slot range.
//!
//! ## Core Concepts
//! - **Shards**: `RegistryShard` indexes instances by service name and by instance id.
//!   Registration is an idempotent upsert keyed by `"serviceName,ip,port"`.
//! - **Listeners**: client connections subscribed to a service receive the full address
//!   list whenever it changes, but only from primary shards.
//! - **Expiry**: `ExpiryService` evicts instances whose heartbeat is older than the
//!   configured timeout.

pub mod expiry;
pub mod shard;
pub mod types;
