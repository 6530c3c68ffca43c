//! Key-value advertisement of cluster masters.
//!
//! After a successful master promotion the engine writes a small set of
//! key-value pairs identifying the new master for the cluster alias, then
//! distributes the same pairs to observer nodes so external tooling
//! (proxies, service discovery) converges on the new topology.

use crate::error::Result;
use crate::types::InstanceKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// External key-value store contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write a single pair to the backing store.
    async fn put(&self, pair: &KvPair) -> Result<()>;

    /// Push pairs out to observer nodes. Distribution failures are
    /// reported but are not fatal to a recovery.
    async fn distribute(&self, pairs: &[KvPair]) -> Result<()>;
}

/// The pairs advertising `master_key` as the master of `cluster_alias`.
pub fn cluster_master_kv_pairs(
    prefix: &str,
    cluster_alias: &str,
    master_key: &InstanceKey,
) -> Vec<KvPair> {
    let base = format!("{}{}", prefix, cluster_alias);
    vec![
        KvPair::new(base.clone(), master_key.string_code()),
        KvPair::new(format!("{}/hostname", base), master_key.hostname.to_lowercase()),
        KvPair::new(format!("{}/port", base), master_key.port.to_string()),
    ]
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, String>>,
    distributed: RwLock<Vec<KvPair>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    /// Pairs handed to `distribute`, in order.
    pub fn distributed(&self) -> Vec<KvPair> {
        self.distributed.read().clone()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, pair: &KvPair) -> Result<()> {
        self.entries
            .write()
            .insert(pair.key.clone(), pair.value.clone());
        Ok(())
    }

    async fn distribute(&self, pairs: &[KvPair]) -> Result<()> {
        self.distributed.write().extend_from_slice(pairs);
        Ok(())
    }
}
