//! Fixed pool of single-thread executors, one picked per proxy.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use super::SingleThreadExecutor;
use crate::error::Result;

/// Pool of [`SingleThreadExecutor`] shards.
///
/// Each proxy is mapped once to a shard by a stable hash of its client
/// name. All of its asynchronous work runs there, which keeps calls made
/// against one proxy in FIFO order while unrelated proxies proceed in
/// parallel on other shards.
#[derive(Debug)]
pub struct ExecutorSharding {
    shards: Vec<Arc<SingleThreadExecutor>>,
}

impl ExecutorSharding {
    /// Start `shard_count` shards (at least one).
    pub fn new(shard_count: usize) -> Result<Self> {
        let shards = (0..shard_count.max(1))
            .map(|i| SingleThreadExecutor::new(format!("leader-proxy-shard-{i}")).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(shards = shards.len(), "Started executor shards");
        Ok(Self { shards })
    }

    /// One shard per available CPU.
    pub fn with_available_parallelism() -> Result<Self> {
        let count = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(count)
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard serving `key`.
    pub fn shard_for(&self, key: &str) -> Arc<SingleThreadExecutor> {
        Arc::clone(&self.shards[shard_index(key, self.shards.len())])
    }

    /// Shut every shard down and wait for the threads to exit.
    pub fn shutdown(&self) {
        for shard in &self.shards {
            shard.shutdown_and_join();
        }
    }
}

/// Stable shard index for `key` (crc32, identical across processes).
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % shard_count.max(1)
}
