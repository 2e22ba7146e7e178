//! Leader Proxy: serve a service only while holding the leadership lease
//!
//! This crate provides:
//!
//! 1. **Leadership proxy** ([`proxy`]): wraps a per-term service instance
//!    (the *delegate*) and forwards calls to it only while this process is
//!    leader. Every call is validated against a quorum and fails with a
//!    retryable [`NotCurrentLeader`] if the term it ran under went stale.
//!
//! 2. **Election interface** ([`election`]): the collaborator a proxy
//!    waits on, plus [`LocalElection`], an in-process implementation for
//!    single-node deployments and tests.
//!
//! 3. **Executors** ([`executor`]) and **bounded retry** ([`retry`]):
//!    sharded single-thread executors and the retrier used for quorum
//!    status checks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  leader_proxy crate                                             │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  proxy module                                           │   │
//! │  │                                                         │   │
//! │  │  LeadershipProxy ──┬──► acquisition (wait, build)      │   │
//! │  │                    ├──► state (token + delegate)       │   │
//! │  │                    └──► dispatch (validate ∥ execute)  │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐   │
//! │  │  election module         │   │  executor + retry        │   │
//! │  │                          │   │                          │   │
//! │  │  LeaderElection (trait)  │   │  ExecutorSharding        │   │
//! │  │  LocalElection           │   │  RetryScheduler          │   │
//! │  │  LeadershipToken         │   │  AsyncRetrier            │   │
//! │  └──────────────────────────┘   └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use leader_proxy::prelude::*;
//!
//! struct LockService;
//!
//! impl Delegate for LockService {}
//!
//! impl LockService {
//!     fn lock(&self, name: &str) -> Result<u64, std::io::Error> {
//!         Ok(name.len() as u64)
//!     }
//! }
//!
//! let executors = ProxyExecutors::with_available_parallelism().unwrap();
//! let election = Arc::new(LocalElection::new());
//! election.grant();
//!
//! let proxy = LeadershipProxy::new(
//!     ProxyConfig::for_client("timelock"),
//!     election.clone(),
//!     || Ok::<_, BoxError>(LockService),
//!     &executors,
//! )
//! .unwrap();
//!
//! match proxy.call(|service| service.lock("row-17")) {
//!     Ok(id) => println!("locked, id {id}"),
//!     Err(e) if e.is_retryable() => println!("not leader, retry elsewhere: {e}"),
//!     Err(e) => println!("failed: {e}"),
//! }
//! ```
//!
//! # Modules
//!
//! - [`proxy`]: The leadership proxy
//! - [`election`]: Election collaborator interface and local implementation
//! - [`delegate`]: What a proxied service implements
//! - [`executor`]: Single-thread executors, sharding, retry scheduler
//! - [`retry`]: Bounded asynchronous retrier
//! - [`config`]: Proxy configuration
//! - [`error`]: Error types
//!
//! # Feature Flags
//!
//! - `sim` (default): Build the `leader-proxy-sim` demo binary

pub mod config;
pub mod delegate;
pub mod election;
pub mod error;
pub mod executor;
pub mod proxy;
pub mod retry;

pub use config::ProxyConfig;
pub use delegate::{ClassifyFailure, Delegate, DelegateFactory, FailureKind};
pub use election::{HostAndPort, LeaderElection, LeadershipToken, LocalElection, StillLeadingStatus};
pub use error::{BoxError, ElectionError, ExecutorError, NotCurrentLeader, ProxyError, RetryError};
pub use executor::{ExecutorSharding, ProxyExecutors, RetryScheduler, SingleThreadExecutor};
pub use proxy::{LeadershipProxy, PendingCall};
pub use retry::{AsyncRetrier, RetryHandle};

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::config::ProxyConfig;
    pub use crate::delegate::{ClassifyFailure, Delegate, FailureKind};
    pub use crate::election::{LeaderElection, LeadershipToken, LocalElection, StillLeadingStatus};
    pub use crate::error::{BoxError, NotCurrentLeader, ProxyError};
    pub use crate::executor::ProxyExecutors;
    pub use crate::proxy::{LeadershipProxy, PendingCall};
}
