use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::types::{
    ChangeListener, ChangeNotifier, ConnectionId, RegistryError, ServiceInstance, instance_id,
};
use crate::partition::types::SlotRange;
use crate::protocol::client::InstanceAddress;

/// Registry state for one slot range.
///
/// Every slot of the range routes here, so one shard holds the instances of many
/// services. A replica shard applies the same mutations as its primary but never
/// notifies listeners; promotion flips it to primary in place.
///
/// Lock order is `services` before `instances`.
pub struct RegistryShard {
    range: SlotRange,

    /// Service name -> instance ids, in registration order.
    services: DashMap<String, Vec<String>>,

    /// Instance id -> instance.
    instances: DashMap<String, ServiceInstance>,

    listeners: DashMap<String, Vec<ChangeListener>>,

    primary: AtomicBool,
    notifier: Arc<dyn ChangeNotifier>,
}

impl RegistryShard {
    pub fn new_primary(range: SlotRange, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self::new(range, true, notifier)
    }

    pub fn new_replica(range: SlotRange, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self::new(range, false, notifier)
    }

    fn new(range: SlotRange, primary: bool, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            range,
            services: DashMap::new(),
            instances: DashMap::new(),
            listeners: DashMap::new(),
            primary: AtomicBool::new(primary),
            notifier,
        }
    }

    pub fn range(&self) -> SlotRange {
        self.range
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    /// Turns a replica into a primary. Listeners registered from now on get notified.
    pub fn promote(&self) {
        self.primary.store(true, Ordering::Release);
    }

    /// Adds the instance, or refreshes its heartbeat if it is already known.
    ///
    /// Returns `true` when the instance was new. Primaries notify the service's
    /// listeners only in that case.
    pub fn register(&self, address: &InstanceAddress) -> bool {
        let now = Instant::now();
        let instance = ServiceInstance::new(address, now);
        let id = instance.instance_id.clone();

        let is_new = {
            let mut ids = self.services.entry(address.service_name.clone()).or_default();
            let is_new = match self.instances.entry(id.clone()) {
                Entry::Occupied(mut existing) => {
                    existing.get_mut().last_heartbeat_at = now;
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(instance);
                    true
                }
            };
            if is_new {
                ids.push(id);
            }
            is_new
        };

        if is_new {
            tracing::debug!(
                "Registered {}:{} for service {} ({})",
                address.ip,
                address.port,
                address.service_name,
                if self.is_primary() { "primary" } else { "replica" }
            );

            if self.is_primary() {
                self.notify_listeners(&address.service_name);
            }
        }

        is_new
    }

    pub fn heartbeat(&self, address: &InstanceAddress) -> Result<(), RegistryError> {
        let id = instance_id(&address.service_name, &address.ip, address.port);

        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.last_heartbeat_at = Instant::now();
                Ok(())
            }
            None => Err(RegistryError::NotRegistered(id)),
        }
    }

    /// Records the listener and returns the current addresses of the service.
    pub fn subscribe(&self, service_name: &str, connection_id: ConnectionId) -> Vec<String> {
        {
            let mut listeners = self.listeners.entry(service_name.to_string()).or_default();
            if !listeners.iter().any(|l| l.connection_id == connection_id) {
                listeners.push(ChangeListener {
                    service_name: service_name.to_string(),
                    connection_id,
                });
            }
        }

        self.addresses(service_name)
    }

    /// Drops every listener owned by a closed connection.
    pub fn remove_connection(&self, connection_id: ConnectionId) {
        for mut entry in self.listeners.iter_mut() {
            entry.value_mut().retain(|l| l.connection_id != connection_id);
        }
        self.listeners.retain(|_, listeners| !listeners.is_empty());
    }

    /// `"serviceName,ip,port"` for every live instance of the service.
    pub fn addresses(&self, service_name: &str) -> Vec<String> {
        self.instances(service_name)
            .into_iter()
            .map(|instance| instance.instance_id)
            .collect()
    }

    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let Some(ids) = self.services.get(service_name) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| self.instances.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn listener_count(&self, service_name: &str) -> usize {
        self.listeners.get(service_name).map_or(0, |l| l.len())
    }

    /// Removes instances whose last heartbeat is older than `timeout`.
    ///
    /// Returns the names of services that lost instances. A primary sends one
    /// notification per changed service.
    pub fn sweep_expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let is_expired =
            |instance: &ServiceInstance| now.saturating_duration_since(instance.last_heartbeat_at) > timeout;

        let candidates: Vec<(String, String)> = self
            .instances
            .iter()
            .filter(|entry| is_expired(entry.value()))
            .map(|entry| (entry.service_name.clone(), entry.key().clone()))
            .collect();

        let mut changed = BTreeSet::new();

        for (service_name, id) in candidates {
            let Some(mut ids) = self.services.get_mut(&service_name) else {
                continue;
            };

            if self
                .instances
                .remove_if(&id, |_, instance| is_expired(instance))
                .is_some()
            {
                ids.retain(|existing| existing != &id);
                tracing::info!("Instance {} expired", id);
                changed.insert(service_name);
            }
        }

        for service_name in &changed {
            self.services
                .remove_if(service_name, |_, ids| ids.is_empty());
        }

        if self.is_primary() {
            for service_name in &changed {
                self.notify_listeners(service_name);
            }
        }

        changed.into_iter().collect()
    }

    fn notify_listeners(&self, service_name: &str) {
        let listeners: Vec<ChangeListener> = match self.listeners.get(service_name) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        let addresses = self.addresses(service_name);
        for listener in listeners {
            self.notifier
                .notify(listener.connection_id, service_name, &addresses);
        }
    }
}
