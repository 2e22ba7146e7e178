//! In-process election.
//!
//! Leadership is granted and revoked explicitly by the embedding code.
//! Single-node deployments use it as their only election; tests use the
//! status override and latency knobs to reproduce partitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{HostAndPort, LeaderElection, LeadershipToken, StillLeadingStatus};
use crate::error::ElectionError;

/// Election whose outcome is decided by calls to [`grant`](Self::grant)
/// and [`revoke`](Self::revoke).
pub struct LocalElection {
    /// Current lease holder token, `None` while not leading.
    leader: watch::Sender<Option<LeadershipToken>>,
    /// Term counter for minted tokens.
    next_term: AtomicU64,
    /// Simulated quorum round trip for `is_still_leading`.
    check_latency: Duration,
    /// Forced answer for status checks (e.g. `NoQuorum` during a partition).
    status_override: Mutex<Option<StillLeadingStatus>>,
    /// Reported by `recently_pinged_leader`.
    leader_hint: Mutex<Option<HostAndPort>>,
    status_checks: AtomicU64,
    blocking_waits: AtomicU64,
}

impl Default for LocalElection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalElection {
    /// Create an election this process has not won yet.
    pub fn new() -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            leader,
            next_term: AtomicU64::new(0),
            check_latency: Duration::ZERO,
            status_override: Mutex::new(None),
            leader_hint: Mutex::new(None),
            status_checks: AtomicU64::new(0),
            blocking_waits: AtomicU64::new(0),
        }
    }

    /// Delay every status check by `latency`.
    pub fn with_check_latency(mut self, latency: Duration) -> Self {
        self.check_latency = latency;
        self
    }

    /// Win a new term. Wakes every blocked waiter.
    pub fn grant(&self) -> LeadershipToken {
        let term = self.next_term.fetch_add(1, Ordering::SeqCst) + 1;
        let token = LeadershipToken::new(term);
        self.leader.send_replace(Some(token.clone()));
        tracing::debug!(term, "Local election granted leadership");
        token
    }

    /// Lose the current term, if any.
    pub fn revoke(&self) {
        if let Some(token) = self.leader.send_replace(None) {
            tracing::debug!(term = token.term(), "Local election revoked leadership");
        }
    }

    /// Whether a term is currently held.
    pub fn is_leading(&self) -> bool {
        self.leader.borrow().is_some()
    }

    /// Force every status check to answer `status`; `None` restores real answers.
    pub fn set_status_override(&self, status: Option<StillLeadingStatus>) {
        *lock(&self.status_override) = status;
    }

    /// Set the peer reported as the recently seen leader.
    pub fn set_leader_hint(&self, hint: Option<HostAndPort>) {
        *lock(&self.leader_hint) = hint;
    }

    /// Number of `is_still_leading` calls served.
    pub fn status_checks(&self) -> u64 {
        self.status_checks.load(Ordering::SeqCst)
    }

    /// Number of `block_on_becoming_leader` calls started.
    pub fn blocking_waits(&self) -> u64 {
        self.blocking_waits.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl LeaderElection for LocalElection {
    fn current_token_if_leading(&self) -> Option<LeadershipToken> {
        self.leader.borrow().clone()
    }

    async fn block_on_becoming_leader(&self) -> Result<LeadershipToken, ElectionError> {
        self.blocking_waits.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.leader.subscribe();
        let token = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ElectionError::Interrupted)?
            .clone();
        token.ok_or(ElectionError::Interrupted)
    }

    async fn is_still_leading(
        &self,
        token: &LeadershipToken,
    ) -> Result<StillLeadingStatus, ElectionError> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        if !self.check_latency.is_zero() {
            tokio::time::sleep(self.check_latency).await;
        }

        let forced = *lock(&self.status_override);
        if let Some(status) = forced {
            return Ok(status);
        }

        let leading = self.leader.borrow().as_ref() == Some(token);
        Ok(if leading {
            StillLeadingStatus::Leading
        } else {
            StillLeadingStatus::NotLeading
        })
    }

    fn recently_pinged_leader(&self) -> Option<HostAndPort> {
        lock(&self.leader_hint).clone()
    }
}
