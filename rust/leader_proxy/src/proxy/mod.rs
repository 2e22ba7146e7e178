//! Leadership-aware service proxy.
//!
//! [`LeadershipProxy`] owns the delegate for the current leadership term
//! and forwards calls to it only while this process holds the lease.
//! Every call is checked against a quorum concurrently with its
//! execution, and its result is released only if the term it ran under
//! is still the live one afterwards.
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!  election ──────►  │ acquisition (own thread)     │ ── try_publish ──┐
//!  factory  ──────►  │ wait, build delegate, retry  │                  ▼
//!                    └──────────────────────────────┘         ┌────────────────┐
//!                                                             │ LeadershipState│
//!  call / call_async ──► dispatch ── current term ──────────  │ (token, D, gen)│
//!                          │                                  └────────────────┘
//!                          ├─► validate-leadership (retrier: shard + scheduler)
//!                          └─► execute-on-delegate (caller thread / shard)
//!                                 └──► reconcile ──► result | NotCurrentLeader
//! ```

mod acquisition;
mod dispatch;
mod state;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::config::ProxyConfig;
use crate::delegate::{ClassifyFailure, Delegate, DelegateFactory};
use crate::election::{LeaderElection, LeadershipToken, StillLeadingStatus};
use crate::error::{ExecutorError, NotCurrentLeader, ProxyError};
use crate::executor::{BlockingWait, ProxyExecutors, SingleThreadExecutor};
use crate::retry::AsyncRetrier;

use state::LeadershipState;

/// Forwards calls to a per-term delegate while this process is leader.
///
/// Service crates usually wrap the proxy in a type implementing their
/// own service trait, forwarding each method through [`call`](Self::call)
/// or [`call_async`](Self::call_async).
pub struct LeadershipProxy<D: Delegate> {
    inner: Arc<ProxyInner<D>>,
}

pub(crate) struct ProxyInner<D> {
    config: ProxyConfig,
    election: Arc<dyn LeaderElection>,
    factory: Box<dyn DelegateFactory<D>>,
    state: LeadershipState<D>,
    /// Runs the blocking leadership wait and delegate construction.
    acquirer: SingleThreadExecutor,
    /// Shard running async calls and status check attempts.
    shard: Arc<SingleThreadExecutor>,
    status_retrier: AsyncRetrier<StillLeadingStatus>,
}

impl<D: Delegate> LeadershipProxy<D> {
    /// Create a proxy and start acquiring leadership.
    ///
    /// If the election already reports this process as leader, the first
    /// delegate is built before this returns.
    pub fn new<F>(
        config: ProxyConfig,
        election: Arc<dyn LeaderElection>,
        factory: F,
        executors: &ProxyExecutors,
    ) -> Result<Self, ExecutorError>
    where
        F: DelegateFactory<D>,
    {
        let shard = executors.sharding().shard_for(&config.client);
        let acquirer = SingleThreadExecutor::new(format!("leader-proxy-acquire-{}", config.client))?;
        let status_retrier = AsyncRetrier::new(
            config.max_no_quorum_attempts,
            config.status_retry_delay,
            executors.scheduler(),
            Arc::clone(&shard),
            |status: &StillLeadingStatus| status.is_conclusive(),
        );

        tracing::debug!(
            client = %config.client,
            shard = shard.name(),
            "Created leadership proxy"
        );

        let inner = Arc::new(ProxyInner {
            config,
            election,
            factory: Box::new(factory),
            state: LeadershipState::new(),
            acquirer,
            shard,
            status_retrier,
        });
        inner.try_to_gain_leadership();

        Ok(Self { inner })
    }

    /// Run a blocking-style operation against the current delegate.
    ///
    /// `op` runs on the calling thread while leadership is validated in
    /// the background; the caller then blocks until validation resolves.
    /// From a multi-thread runtime worker the wait uses `block_in_place`.
    /// On a current-thread runtime the call fails with
    /// [`ExecutorError::BlockedInRuntime`] before `op` runs.
    pub fn call<R, E, F>(&self, op: F) -> Result<R, ProxyError<E>>
    where
        F: FnOnce(&D) -> Result<R, E>,
        E: ClassifyFailure,
    {
        self.inner.call(op)
    }

    /// Run an asynchronous-style operation against the current delegate.
    ///
    /// Returns immediately. `op` is invoked on this proxy's shard in
    /// submission order, and its future is reconciled with leadership
    /// validation there.
    pub fn call_async<R, E, F, Fut>(&self, op: F) -> PendingCall<R, E>
    where
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: ClassifyFailure + Send + 'static,
    {
        self.inner.call_async(op)
    }

    /// Shut the proxy down: stop acquiring and release the delegate.
    ///
    /// Idempotent. Later calls fail with [`ProxyError::AlreadyClosed`].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Token of the term currently being served, if any.
    pub fn current_token(&self) -> Option<LeadershipToken> {
        self.inner.state.current_token()
    }

    /// Client name this proxy serves.
    pub fn client(&self) -> &str {
        &self.inner.config.client
    }
}

impl<D: Delegate> Drop for LeadershipProxy<D> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<D: Delegate> fmt::Debug for LeadershipProxy<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipProxy")
            .field("client", &self.inner.config.client)
            .field("closed", &self.is_closed())
            .field("token", &self.current_token())
            .finish()
    }
}

impl<D: Delegate> ProxyInner<D> {
    fn close(&self) {
        if self.state.close() {
            tracing::debug!(client = %self.config.client, "Closing leadership proxy");
        }
        self.acquirer.shutdown();
    }

    fn not_current_leader(&self, message: &str, cause: Option<String>) -> NotCurrentLeader {
        NotCurrentLeader::new(message)
            .with_leader_hint(self.election.recently_pinged_leader())
            .with_cause(cause)
    }
}

/// Result of [`LeadershipProxy::call_async`] that is still being computed.
///
/// Await it, or block on it with [`blocking_wait`](Self::blocking_wait)
/// outside of async contexts.
pub struct PendingCall<R, E> {
    rx: oneshot::Receiver<Result<R, ProxyError<E>>>,
    executor: String,
}

impl<R, E> PendingCall<R, E> {
    fn new(rx: oneshot::Receiver<Result<R, ProxyError<E>>>, executor: &str) -> Self {
        Self {
            rx,
            executor: executor.to_string(),
        }
    }

    fn ready(result: Result<R, ProxyError<E>>, executor: &str) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, executor)
    }

    /// Block the current thread until the call completes.
    ///
    /// Usable from a multi-thread runtime worker; fails with
    /// [`ExecutorError::BlockedInRuntime`] on a current-thread runtime.
    pub fn blocking_wait(self) -> Result<R, ProxyError<E>> {
        let wait = BlockingWait::for_current_thread(&self.executor)?;
        let (rx, executor) = (self.rx, self.executor);
        wait.run(move || rx.blocking_recv())
            .unwrap_or_else(|_| Err(task_lost(executor)))
    }
}

impl<R, E> Future for PendingCall<R, E> {
    type Output = Result<R, ProxyError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(task_lost(this.executor.clone()))))
    }
}

impl<R, E> fmt::Debug for PendingCall<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

fn task_lost<E>(name: String) -> ProxyError<E> {
    ProxyError::Executor(ExecutorError::TaskLost { name })
}
