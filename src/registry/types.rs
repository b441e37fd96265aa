use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::client::InstanceAddress;

/// Identifies one client connection on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A registered endpoint of a service.
///
/// `instance_id` is `"serviceName,ip,port"`, which is also the address form pushed
/// to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub instance_id: String,
    pub last_heartbeat_at: Instant,
}

impl ServiceInstance {
    pub fn new(address: &InstanceAddress, now: Instant) -> Self {
        Self {
            service_name: address.service_name.clone(),
            ip: address.ip.clone(),
            port: address.port,
            instance_id: instance_id(&address.service_name, &address.ip, address.port),
            last_heartbeat_at: now,
        }
    }
}

pub fn instance_id(service_name: &str, ip: &str, port: u16) -> String {
    format!("{},{},{}", service_name, ip, port)
}

/// A client connection waiting for changes of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeListener {
    pub service_name: String,
    pub connection_id: ConnectionId,
}

/// Delivers service-changed notifications to subscribed connections.
///
/// Implementations must not block: the registry calls this while handling requests
/// and during expiry sweeps.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, connection_id: ConnectionId, service_name: &str, addresses: &[String]);
}

#[derive(Debug, Clone, Copy)]
pub struct ExpiryConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Instance {0} is not registered")]
    NotRegistered(String),

    #[error("Service {service_name} (slot {slot}) is not owned by this node")]
    NotOwned { service_name: String, slot: u16 },
}
