//! Leader Proxy Simulator
//!
//! Drives a lock service through a [`LeadershipProxy`] while an in-process
//! election grants and revokes leadership, logging what callers observe.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info leader-proxy-sim
//!
//! LEADER_PROXY_CLIENT=tenant-7 LEADER_PROXY_ROUNDS=5 \
//!   LEADER_PROXY_CONFIG='{"status_retry_delay_ms":50}' \
//!   leader-proxy-sim
//! ```
//!
//! # Environment Variables
//!
//! - `LEADER_PROXY_CLIENT`: Client name (overrides the one in the config)
//! - `LEADER_PROXY_CONFIG`: Proxy configuration as JSON (defaults apply to missing fields)
//! - `LEADER_PROXY_ROUNDS`: Number of grant/revoke rounds (defaults to 3)

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use leader_proxy::prelude::*;

/// Lock table for one leadership term.
#[derive(Default)]
struct InMemoryLocks {
    held: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
enum LockError {
    #[error("lock {0} is already held")]
    AlreadyHeld(String),
    #[error("lock table unavailable")]
    Unavailable,
}

impl ClassifyFailure for LockError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            LockError::Unavailable => FailureKind::NotLeading,
            LockError::AlreadyHeld(_) => FailureKind::Other,
        }
    }
}

/// The service surface, implemented by the delegate and by the proxy wrapper.
trait LockService {
    type Error: std::fmt::Display;

    fn lock(&self, name: &str) -> Result<u64, Self::Error>;
    fn unlock(&self, name: &str) -> Result<bool, Self::Error>;
}

impl InMemoryLocks {
    fn held_count(&self) -> Result<usize, LockError> {
        let held = self.held.lock().map_err(|_| LockError::Unavailable)?;
        Ok(held.len())
    }
}

impl LockService for InMemoryLocks {
    type Error = LockError;

    fn lock(&self, name: &str) -> Result<u64, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Unavailable)?;
        if held.contains_key(name) {
            return Err(LockError::AlreadyHeld(name.to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        held.insert(name.to_string(), id);
        Ok(id)
    }

    fn unlock(&self, name: &str) -> Result<bool, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Unavailable)?;
        Ok(held.remove(name).is_some())
    }
}

impl Delegate for InMemoryLocks {
    fn close(&self) -> Result<(), BoxError> {
        let held = self.held_count()?;
        tracing::info!(held, "Lock table closed");
        Ok(())
    }
}

/// Forwards every [`LockService`] call through the proxy.
struct ProxiedLocks {
    proxy: LeadershipProxy<InMemoryLocks>,
}

impl LockService for ProxiedLocks {
    type Error = ProxyError<LockError>;

    fn lock(&self, name: &str) -> Result<u64, Self::Error> {
        self.proxy.call(|locks| locks.lock(name))
    }

    fn unlock(&self, name: &str) -> Result<bool, Self::Error> {
        self.proxy.call(|locks| locks.unlock(name))
    }
}

impl ProxiedLocks {
    fn held_count(&self) -> PendingCall<usize, LockError> {
        self.proxy.call_async(|locks| async move { locks.held_count() })
    }
}

fn wait_for_term(proxy: &LeadershipProxy<InMemoryLocks>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while proxy.current_token().is_none() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("leader_proxy=debug".parse()?),
        )
        .init();

    // Parse configuration from environment
    let mut config = match env::var("LEADER_PROXY_CONFIG") {
        Ok(json) => ProxyConfig::from_json(&json)?,
        Err(_) => ProxyConfig::for_client("timelock"),
    };
    if let Ok(client) = env::var("LEADER_PROXY_CLIENT") {
        config.client = client;
    }

    let rounds: u32 = env::var("LEADER_PROXY_ROUNDS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .map_err(|e| format!("LEADER_PROXY_ROUNDS must be a valid u32: {}", e))?;

    tracing::info!(
        "Starting leader proxy simulation\n  Client: {}\n  Rounds: {}\n  Status checks: {} x {:?}",
        config.client,
        rounds,
        config.max_no_quorum_attempts,
        config.status_retry_delay
    );

    let executors = ProxyExecutors::with_available_parallelism()?;
    let election = Arc::new(LocalElection::new().with_check_latency(Duration::from_millis(5)));
    let locks = ProxiedLocks {
        proxy: LeadershipProxy::new(
            config,
            election.clone(),
            || Ok::<_, BoxError>(InMemoryLocks::default()),
            &executors,
        )?,
    };

    match locks.lock("before-election") {
        Ok(id) => tracing::warn!(id, "Locked without leadership"),
        Err(e) => tracing::info!("Call before leadership rejected: {}", e),
    }

    for round in 1..=rounds {
        let token = election.grant();
        if !wait_for_term(&locks.proxy, Duration::from_secs(5)) {
            return Err(format!("round {}: proxy did not pick up {}", round, token).into());
        }
        tracing::info!(round, %token, "Serving");

        for name in ["row-1", "row-2", "row-1"] {
            match locks.lock(name) {
                Ok(id) => tracing::info!(round, name, id, "Locked"),
                Err(e) => tracing::info!(round, name, "Lock refused: {}", e),
            }
        }
        let released = locks.unlock("row-2")?;
        let held = locks.held_count().blocking_wait()?;
        tracing::info!(round, released, held, "Lock table state");

        election.revoke();
        match locks.lock("after-revoke") {
            Ok(id) => tracing::warn!(round, id, "Stale term served a call"),
            Err(e) if e.is_retryable() => tracing::info!(round, "Revoked: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    locks.proxy.close();
    executors.shutdown();
    tracing::info!("Simulation finished");
    Ok(())
}
