//! Table persistence.
//!
//! Each logical table lives in its own file framed as
//! `[8B checksum][4B length][payload]`, where the checksum is the Adler-32 of the
//! payload widened to 8 bytes and the payload is JSON. Writes go to a temporary file
//! that is flushed and synced before it replaces the previous version.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const SLOTS_ALLOCATION: &str = "slots_allocation";
pub const SLOTS_REPLICA_ALLOCATION: &str = "slots_replica_allocation";
pub const REPLICA_NODE_IDS: &str = "replica_node_ids";
pub const NODE_SLOTS: &str = "node_slots";
pub const NODE_SLOTS_REPLICAS: &str = "node_slots_replicas";

const HEADER_LEN: usize = 12;
const FILE_SUFFIX: &str = ".tbl";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on table '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Table '{key}' is truncated ({len} bytes)")]
    Truncated { key: String, len: usize },

    #[error("Table '{key}' is corrupted: checksum {actual:#x}, expected {expected:#x}")]
    Corrupted {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Table '{key}' could not be (de)serialized: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn checksum(payload: &[u8]) -> u64 {
    adler2::adler32_slice(payload) as u64
}

pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
    record.extend_from_slice(&checksum(payload).to_be_bytes());
    record.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    record.extend_from_slice(payload);
    record
}

/// Validates framing and checksum, returning the payload.
pub fn decode_record<'a>(key: &str, record: &'a [u8]) -> Result<&'a [u8], PersistenceError> {
    let truncated = || PersistenceError::Truncated {
        key: key.to_string(),
        len: record.len(),
    };

    if record.len() < HEADER_LEN {
        return Err(truncated());
    }

    let mut checksum_bytes = [0u8; 8];
    checksum_bytes.copy_from_slice(&record[..8]);
    let expected = u64::from_be_bytes(checksum_bytes);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&record[8..HEADER_LEN]);
    let len = i32::from_be_bytes(len_bytes);
    if len < 0 || record.len() - HEADER_LEN != len as usize {
        return Err(truncated());
    }

    let payload = &record[HEADER_LEN..];
    let actual = checksum(payload);
    if actual != expected {
        return Err(PersistenceError::Corrupted {
            key: key.to_string(),
            expected,
            actual,
        });
    }

    Ok(payload)
}

/// Durable store for the partition tables of one node.
#[derive(Debug, Clone)]
pub struct TableStore {
    dir: PathBuf,
}

impl TableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, FILE_SUFFIX))
    }

    /// Returns only after the table is on stable storage.
    pub async fn persist<T: Serialize>(&self, key: &str, table: &T) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            key: key.to_string(),
            source,
        };

        let payload = serde_json::to_vec(table).map_err(|source| PersistenceError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let record = encode_record(&payload);

        fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&record).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &path).await.map_err(io_err)?;

        tracing::debug!("Persisted table '{}' ({} bytes)", key, payload.len());
        Ok(())
    }

    /// Loads a table, or `None` if it was never persisted.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let record = match fs::read(self.path_for(key)).await {
            Ok(record) => record,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    key: key.to_string(),
                    source,
                });
            }
        };

        let payload = decode_record(key, &record)?;
        let table = serde_json::from_slice(payload).map_err(|source| {
            PersistenceError::Serialization {
                key: key.to_string(),
                source,
            }
        })?;
        Ok(Some(table))
    }
}
