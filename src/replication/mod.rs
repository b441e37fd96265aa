//! Replication Module
//!
//! Keeps replica shards in step with their primaries by replaying client mutations.
//! Forwarding is fire-and-forget: a lost frame leaves the replica behind until the
//! next heartbeat of the same instance reaches it.

pub mod forwarder;

#[cfg(test)]
mod tests;
