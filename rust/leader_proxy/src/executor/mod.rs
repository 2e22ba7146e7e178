//! Execution resources shared by proxies.
//!
//! Three kinds of execution context touch a proxy:
//!
//! - one **acquisition thread** per proxy (a [`SingleThreadExecutor`]
//!   owned by the proxy) that blocks waiting for leadership;
//! - one **shard** per proxy, picked from [`ExecutorSharding`], running
//!   async calls, status-check attempts and their continuations;
//! - the process-wide [`RetryScheduler`] that only sleeps between
//!   status-check attempts.
//!
//! Shards and the scheduler are bundled in [`ProxyExecutors`], built once
//! at process start and handed to every proxy.

mod sharding;
mod single_thread;

pub use sharding::{shard_index, ExecutorSharding};
pub use single_thread::SingleThreadExecutor;

use std::sync::{Mutex, PoisonError};

use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

use crate::error::{ExecutorError, Result};

const SCHEDULER_THREAD_NAME: &str = "leader-proxy-scheduler";

/// Runtime used to time delays between retry attempts.
pub struct RetryScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl RetryScheduler {
    /// Start the scheduler with a single worker thread.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(SCHEDULER_THREAD_NAME)
            .enable_time()
            .build()
            .map_err(|e| ExecutorError::Spawn {
                name: SCHEDULER_THREAD_NAME.to_string(),
                reason: e.to_string(),
            })?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    /// Handle for spawning timer-driven tasks.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stop the scheduler. Pending delays are abandoned.
    ///
    /// Safe to call from async contexts; does not wait for the worker.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler").finish_non_exhaustive()
    }
}

/// How the current thread may block on a result produced elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockingWait {
    /// Outside any runtime.
    Direct,
    /// Inside a multi-thread runtime: step out with `block_in_place`.
    InPlace,
}

impl BlockingWait {
    /// Classify the calling thread. Fails on a current-thread runtime.
    pub(crate) fn for_current_thread(name: &str) -> Result<Self> {
        match Handle::try_current() {
            Err(_) => Ok(Self::Direct),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => Ok(Self::InPlace),
            Ok(_) => Err(ExecutorError::BlockedInRuntime {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn run<T>(self, wait: impl FnOnce() -> T) -> T {
        match self {
            Self::Direct => wait(),
            Self::InPlace => tokio::task::block_in_place(wait),
        }
    }
}

/// Shards plus scheduler: the injected execution resource for proxies.
#[derive(Debug)]
pub struct ProxyExecutors {
    sharding: ExecutorSharding,
    scheduler: RetryScheduler,
}

impl ProxyExecutors {
    /// Start `shard_count` shards and the scheduler.
    pub fn new(shard_count: usize) -> Result<Self> {
        Ok(Self {
            sharding: ExecutorSharding::new(shard_count)?,
            scheduler: RetryScheduler::new()?,
        })
    }

    /// One shard per available CPU.
    pub fn with_available_parallelism() -> Result<Self> {
        Ok(Self {
            sharding: ExecutorSharding::with_available_parallelism()?,
            scheduler: RetryScheduler::new()?,
        })
    }

    /// The shard pool.
    pub fn sharding(&self) -> &ExecutorSharding {
        &self.sharding
    }

    /// The retry scheduler.
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Tear everything down. Proxies still using these executors fail
    /// their calls with [`ExecutorError::Shutdown`].
    pub fn shutdown(&self) {
        self.sharding.shutdown();
        self.scheduler.shutdown();
    }
}
