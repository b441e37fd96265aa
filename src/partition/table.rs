//! Local Partition Table
//!
//! Maps this node's primary and replica slot ranges to their registry shards and
//! routes service names to slots.

use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::types::{SLOT_COUNT, SlotRange};
use crate::membership::types::NodeId;
use crate::registry::shard::RegistryShard;
use crate::registry::types::{ChangeNotifier, ConnectionId};

/// 31-multiplier string hash over UTF-16 code units with wrapping `i32` arithmetic.
///
/// Clients compute the same value to find the node owning a service, so this must
/// stay bit-compatible with their implementation.
pub fn java_string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Slot in `1..=SLOT_COUNT` for a service name.
pub fn slot_for(service_name: &str) -> u16 {
    let slot = ((java_string_hash(service_name) & 0x7fff_ffff) % SLOT_COUNT as i32) as u16;
    if slot == 0 { 1 } else { slot }
}

pub struct PartitionTable {
    primaries: RwLock<Vec<Arc<RegistryShard>>>,
    replicas: RwLock<Vec<Arc<RegistryShard>>>,
    replica_node_id: RwLock<Option<NodeId>>,
    primaries_initialized: AtomicBool,
    replicas_initialized: AtomicBool,
    notifier: Arc<dyn ChangeNotifier>,
}

impl PartitionTable {
    pub fn new(notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            primaries: RwLock::new(Vec::new()),
            replicas: RwLock::new(Vec::new()),
            replica_node_id: RwLock::new(None),
            primaries_initialized: AtomicBool::new(false),
            replicas_initialized: AtomicBool::new(false),
            notifier,
        }
    }

    /// Installs the primary ranges of this node. Shards of ranges that stay owned
    /// are kept with their contents.
    pub fn init_from_ranges(&self, ranges: &[SlotRange]) {
        let mut primaries = self.primaries.write();
        *primaries = self.reconcile(&primaries, ranges, true);
        self.primaries_initialized.store(true, Ordering::Release);

        tracing::info!("Primary slot ranges: {}", format_ranges(ranges));
    }

    pub fn init_replicas_from_ranges(&self, ranges: &[SlotRange]) {
        let mut replicas = self.replicas.write();
        *replicas = self.reconcile(&replicas, ranges, false);
        self.replicas_initialized.store(true, Ordering::Release);

        tracing::info!("Replica slot ranges: {}", format_ranges(ranges));
    }

    /// Starts holding replicas for additional ranges. Already held ranges are ignored.
    pub fn add_replica_ranges(&self, ranges: &[SlotRange]) {
        let mut replicas = self.replicas.write();

        for range in ranges {
            if replicas.iter().any(|shard| shard.range() == *range) {
                continue;
            }
            replicas.push(Arc::new(RegistryShard::new_replica(
                *range,
                self.notifier.clone(),
            )));
        }
        replicas.sort_by_key(|shard| shard.range());
        self.replicas_initialized.store(true, Ordering::Release);
    }

    /// Moves the replica shards of `ranges` into the primary set and promotes them.
    ///
    /// Ranges without a replica shard here become empty primaries. Returns the
    /// ranges that were promoted from replica state.
    pub fn promote(&self, ranges: &[SlotRange]) -> Vec<SlotRange> {
        let mut primaries = self.primaries.write();
        let mut replicas = self.replicas.write();
        let mut promoted = Vec::new();

        for range in ranges {
            if primaries.iter().any(|shard| shard.range() == *range) {
                continue;
            }

            match replicas.iter().position(|shard| shard.range() == *range) {
                Some(idx) => {
                    let shard = replicas.remove(idx);
                    shard.promote();
                    primaries.push(shard);
                    promoted.push(*range);
                }
                None => {
                    tracing::warn!("No replica held for {}, starting it empty", range);
                    primaries.push(Arc::new(RegistryShard::new_primary(
                        *range,
                        self.notifier.clone(),
                    )));
                }
            }
        }

        primaries.sort_by_key(|shard| shard.range());
        self.primaries_initialized.store(true, Ordering::Release);
        promoted
    }

    pub fn set_replica_node_id(&self, node_id: Option<NodeId>) {
        *self.replica_node_id.write() = node_id;
    }

    pub fn replica_node_id(&self) -> Option<NodeId> {
        *self.replica_node_id.read()
    }

    pub fn route(&self, service_name: &str) -> u16 {
        slot_for(service_name)
    }

    /// Primary shard owning the service's slot, if this node owns it.
    pub fn shard(&self, service_name: &str) -> Option<Arc<RegistryShard>> {
        let slot = slot_for(service_name);
        self.shard_for_slot(slot)
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<Arc<RegistryShard>> {
        self.primaries
            .read()
            .iter()
            .find(|shard| shard.range().contains(slot))
            .cloned()
    }

    pub fn replica_shard(&self, service_name: &str) -> Option<Arc<RegistryShard>> {
        let slot = slot_for(service_name);
        self.replicas
            .read()
            .iter()
            .find(|shard| shard.range().contains(slot))
            .cloned()
    }

    pub fn primary_ranges(&self) -> Vec<SlotRange> {
        self.primaries.read().iter().map(|s| s.range()).collect()
    }

    pub fn replica_ranges(&self) -> Vec<SlotRange> {
        self.replicas.read().iter().map(|s| s.range()).collect()
    }

    pub fn all_shards(&self) -> Vec<Arc<RegistryShard>> {
        let mut shards: Vec<Arc<RegistryShard>> = self.primaries.read().clone();
        shards.extend(self.replicas.read().iter().cloned());
        shards
    }

    pub fn remove_connection(&self, connection_id: ConnectionId) {
        for shard in self.primaries.read().iter() {
            shard.remove_connection(connection_id);
        }
    }

    /// True once both primary and replica ranges have been installed.
    pub fn is_initialized(&self) -> bool {
        self.primaries_initialized.load(Ordering::Acquire)
            && self.replicas_initialized.load(Ordering::Acquire)
    }

    fn reconcile(
        &self,
        current: &[Arc<RegistryShard>],
        ranges: &[SlotRange],
        primary: bool,
    ) -> Vec<Arc<RegistryShard>> {
        let mut shards: Vec<Arc<RegistryShard>> = ranges
            .iter()
            .map(|range| {
                match current.iter().find(|shard| shard.range() == *range) {
                    Some(existing) => existing.clone(),
                    None if primary => {
                        Arc::new(RegistryShard::new_primary(*range, self.notifier.clone()))
                    }
                    None => Arc::new(RegistryShard::new_replica(*range, self.notifier.clone())),
                }
            })
            .collect();
        shards.sort_by_key(|shard| shard.range());
        shards
    }
}

pub fn format_ranges(ranges: &[SlotRange]) -> String {
    if ranges.is_empty() {
        return "none".to_string();
    }
    ranges
        .iter()
        .map(|r| format!("[{}]", r))
        .collect::<Vec<_>>()
        .join(" ")
}
