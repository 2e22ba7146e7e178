//! Acquisition: wait for leadership, build a delegate, publish the term.
//!
//! ```text
//! IDLE ─► ACQUIRING ─► LEADING ─(lost)─► ACQUIRING ─► ... ─► CLOSED
//! ```
//!
//! Leadership acquisition is never abandoned while the proxy is open.
//! Election and factory failures are logged and retried; they never reach
//! callers, who see `NotCurrentLeader` until a term is published.

use std::sync::Arc;

use crate::delegate::Delegate;
use crate::election::LeadershipToken;
use crate::error::ElectionError;
use crate::retry::jittered;

use super::ProxyInner;

impl<D: Delegate> ProxyInner<D> {
    /// Start acquiring leadership.
    ///
    /// Takes the fast path when the election already reports a lease:
    /// the first delegate construction then runs on the calling thread.
    /// Otherwise, or if that construction fails, the work moves to the
    /// acquisition thread.
    pub(super) fn try_to_gain_leadership(self: &Arc<Self>) {
        if self.state.is_closed() {
            return;
        }

        let Some(token) = self.election.current_token_if_leading() else {
            self.spawn_acquisition(None, 0);
            return;
        };

        tracing::debug!(
            client = %self.config.client,
            term = token.term(),
            "Already leading, building delegate"
        );
        match self.factory.create() {
            Ok(delegate) => self.on_delegate_built(token, delegate),
            Err(e) => {
                tracing::error!(
                    client = %self.config.client,
                    term = token.term(),
                    attempt = 1,
                    "Problem creating delegate: {}",
                    e
                );
                self.spawn_acquisition(Some(token), 1);
            }
        }
    }

    fn spawn_acquisition(self: &Arc<Self>, known: Option<LeadershipToken>, failed_attempts: u32) {
        let inner = Arc::clone(self);
        let task = inner.gain_leadership_with_retry(known, failed_attempts);
        if let Err(e) = self.acquirer.spawn(task) {
            if !self.state.is_closed() {
                tracing::error!(
                    client = %self.config.client,
                    "Failed to submit acquisition task but proxy not closed: {}",
                    e
                );
            }
        }
    }

    async fn gain_leadership_with_retry(
        self: Arc<Self>,
        mut known: Option<LeadershipToken>,
        failed_attempts: u32,
    ) {
        loop {
            if self.state.is_closed() {
                tracing::debug!(client = %self.config.client, "Proxy closed, stopping acquisition");
                return;
            }

            let token = match known.take() {
                Some(token) => token,
                None => match self.gain_leadership_blocking().await {
                    Some(token) => token,
                    None => {
                        if self.state.is_closed() {
                            return;
                        }
                        tokio::time::sleep(self.config.gain_leadership_backoff).await;
                        continue;
                    }
                },
            };

            if let Some(delegate) = self.build_delegate(&token, failed_attempts).await {
                self.on_delegate_built(token, delegate);
            }
            return;
        }
    }

    async fn gain_leadership_blocking(&self) -> Option<LeadershipToken> {
        tracing::debug!(client = %self.config.client, "Block until gained leadership");
        match self.election.block_on_becoming_leader().await {
            Ok(token) => Some(token),
            Err(_) if self.state.is_closed() => None,
            Err(ElectionError::Interrupted) => {
                tracing::warn!(client = %self.config.client, "Attempt to gain leadership interrupted");
                None
            }
            Err(e) => {
                tracing::error!(client = %self.config.client, "Problem blocking on leadership: {}", e);
                None
            }
        }
    }

    /// Call the factory until it succeeds. `None` if the proxy closed first.
    async fn build_delegate(&self, token: &LeadershipToken, mut failures: u32) -> Option<D> {
        loop {
            if failures > 0 {
                tokio::time::sleep(jittered(self.config.construction_backoff, failures)).await;
            }
            if self.state.is_closed() {
                return None;
            }
            match self.factory.create() {
                Ok(delegate) => return Some(delegate),
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        client = %self.config.client,
                        term = token.term(),
                        attempt = failures,
                        "Problem creating delegate: {}",
                        e
                    );
                }
            }
        }
    }

    fn on_delegate_built(&self, token: LeadershipToken, delegate: D) {
        let term = token.term();
        match self.state.try_publish(token, delegate) {
            Some(published) => tracing::info!(
                client = %self.config.client,
                term,
                generation = published.generation(),
                "Gained leadership"
            ),
            None => tracing::debug!(
                client = %self.config.client,
                term,
                "Proxy closed while building delegate, released it"
            ),
        }
    }
}
