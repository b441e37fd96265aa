use std::sync::Arc;
use tokio::time::Instant;

use super::types::ExpiryConfig;
use crate::node::status::StatusHandle;
use crate::partition::table::PartitionTable;

/// Periodically evicts instances that stopped sending heartbeats, on primary and
/// replica shards alike.
pub struct ExpiryService {
    table: Arc<PartitionTable>,
    config: ExpiryConfig,
}

impl ExpiryService {
    pub fn new(table: Arc<PartitionTable>, config: ExpiryConfig) -> Arc<Self> {
        Arc::new(Self { table, config })
    }

    pub fn start(self: Arc<Self>, status: StatusHandle) -> tokio::task::JoinHandle<()> {
        tracing::info!(
            "Starting heartbeat expiry (check every {:?}, timeout {:?})",
            self.config.check_interval,
            self.config.timeout
        );

        tokio::spawn(async move {
            self.expiry_loop(status).await;
        })
    }

    async fn expiry_loop(self: Arc<Self>, status: StatusHandle) {
        let mut interval = tokio::time::interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = status.terminated() => break,
            }

            let removed = self.sweep(Instant::now());
            if removed > 0 {
                tracing::debug!("Expiry sweep changed {} service(s)", removed);
            }
        }
    }

    /// Runs one sweep over every shard, returning how many services changed.
    pub fn sweep(&self, now: Instant) -> usize {
        self.table
            .all_shards()
            .iter()
            .map(|shard| shard.sweep_expired(now, self.config.timeout).len())
            .sum()
    }
}
