//! Per-call dispatch.
//!
//! A call snapshots the live term, validates its token against a quorum
//! while the operation runs, and releases the result only if validation
//! said `Leading` and the same term is still live afterwards.
//!
//! ```text
//! STARTED ─► { VALIDATING ∥ EXECUTING } ─► RECONCILING ─► SUCCEEDED
//!                                                      ├► FAILED(not leader)
//!                                                      └► FAILED(delegate error)
//! ```
//!
//! Losing the invalidation race is not an error of its own: the losing
//! call just fails with `NotCurrentLeader`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::Instrument;

use crate::delegate::{ClassifyFailure, Delegate, FailureKind};
use crate::election::StillLeadingStatus;
use crate::error::{ElectionError, ExecutorError, NotCurrentLeader, ProxyError, RetryError};
use crate::executor::BlockingWait;
use crate::retry::RetryHandle;

use super::state::Term;
use super::{PendingCall, ProxyInner};

type Validation = RetryHandle<StillLeadingStatus, ElectionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Valid,
    Stale,
}

impl<D: Delegate> ProxyInner<D> {
    pub(super) fn call<R, E, F>(self: &Arc<Self>, op: F) -> Result<R, ProxyError<E>>
    where
        F: FnOnce(&D) -> Result<R, E>,
        E: ClassifyFailure,
    {
        BlockingWait::for_current_thread("leadership validation")?;
        let term = self.current_term::<E>()?;
        let validation = self.start_validation(&term);

        let outcome = {
            let _span = tracing::debug_span!(
                "execute-on-delegate",
                client = %self.config.client,
                term = term.token().term()
            )
            .entered();
            op(term.delegate())
        };

        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                validation.cancel();
                return Err(self.handle_delegate_failure(&term, e));
            }
        };

        let verdict = self.verdict(validation.blocking_wait())?;
        self.reconcile(&term, verdict, value)
    }

    pub(super) fn call_async<R, E, F, Fut>(self: &Arc<Self>, op: F) -> PendingCall<R, E>
    where
        F: FnOnce(Arc<D>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: ClassifyFailure + Send + 'static,
    {
        let shard = self.shard.name();
        let term = match self.current_term() {
            Ok(term) => term,
            Err(e) => return PendingCall::ready(Err(e), shard),
        };
        let validation = self.start_validation(&term);

        let delegate = Arc::clone(term.delegate());
        let span = tracing::debug_span!(
            "execute-on-delegate",
            client = %self.config.client,
            term = term.token().term()
        );
        let operation = match self.shard.submit(move || op(delegate).instrument(span)) {
            Ok(operation) => operation,
            Err(e) => {
                validation.cancel();
                return PendingCall::ready(Err(e.into()), shard);
            }
        };

        let inner = Arc::clone(self);
        match self
            .shard
            .spawn(async move { inner.reconcile_async(term, operation, validation).await })
        {
            Ok(rx) => PendingCall::new(rx, shard),
            Err(e) => PendingCall::ready(Err(e.into()), shard),
        }
    }

    /// The live term, or the error a call without one fails with.
    fn current_term<E>(&self) -> Result<Arc<Term<D>>, ProxyError<E>> {
        if self.state.is_closed() {
            return Err(ProxyError::AlreadyClosed(self.config.client.clone()));
        }
        if let Some(term) = self.state.current() {
            return Ok(term);
        }

        let err = self.not_current_leader("method invoked on a non-leader", None);
        if err.leader_hint().is_some() {
            // Leadership may have been gained while building the error.
            if let Some(term) = self.state.current() {
                return Ok(term);
            }
        }
        Err(err.into())
    }

    fn start_validation(&self, term: &Term<D>) -> Validation {
        let election = Arc::clone(&self.election);
        let token = term.token().clone();
        let span = tracing::debug_span!(
            "validate-leadership",
            client = %self.config.client,
            term = token.term()
        );
        self.status_retrier.execute(move || {
            let election = Arc::clone(&election);
            let token = token.clone();
            async move { election.is_still_leading(&token).await }.instrument(span.clone())
        })
    }

    fn verdict(
        &self,
        checked: Result<StillLeadingStatus, RetryError<ElectionError>>,
    ) -> Result<Verdict, ExecutorError> {
        match checked {
            Ok(StillLeadingStatus::Leading) => Ok(Verdict::Valid),
            Ok(StillLeadingStatus::NotLeading) => Ok(Verdict::Stale),
            // Repeated NO_QUORUM: most likely cut off from the other nodes.
            Ok(StillLeadingStatus::NoQuorum) => Ok(Verdict::Stale),
            Err(RetryError::Attempt(e)) => {
                tracing::warn!(
                    client = %self.config.client,
                    "Leadership check kept failing, assuming not leading: {}",
                    e
                );
                Ok(Verdict::Stale)
            }
            Err(RetryError::Executor(e)) => Err(e),
            Err(RetryError::Cancelled) => Err(ExecutorError::TaskLost {
                name: "leadership validation".to_string(),
            }),
        }
    }

    async fn reconcile_async<R, E>(
        self: Arc<Self>,
        term: Arc<Term<D>>,
        mut operation: oneshot::Receiver<Result<R, E>>,
        mut validation: Validation,
    ) -> Result<R, ProxyError<E>>
    where
        E: ClassifyFailure,
    {
        tokio::select! {
            outcome = &mut operation => {
                let value = match outcome {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        validation.cancel();
                        return Err(self.handle_delegate_failure(&term, e));
                    }
                    Err(_) => {
                        validation.cancel();
                        return Err(self.operation_lost());
                    }
                };
                let verdict = self.verdict(validation.await)?;
                self.reconcile(&term, verdict, value)
            }
            checked = &mut validation => {
                if self.verdict(checked)? == Verdict::Stale {
                    return Err(self.mark_not_leading(&term, None).into());
                }
                match operation.await {
                    Ok(Ok(value)) => self.reconcile(&term, Verdict::Valid, value),
                    Ok(Err(e)) => Err(self.handle_delegate_failure(&term, e)),
                    Err(_) => Err(self.operation_lost()),
                }
            }
        }
    }

    fn operation_lost<E>(&self) -> ProxyError<E> {
        ExecutorError::TaskLost {
            name: self.shard.name().to_string(),
        }
        .into()
    }

    fn reconcile<R, E>(
        self: &Arc<Self>,
        term: &Arc<Term<D>>,
        verdict: Verdict,
        value: R,
    ) -> Result<R, ProxyError<E>> {
        if verdict == Verdict::Stale {
            return Err(self.mark_not_leading(term, None).into());
        }
        if self.state.is_closed() {
            return Err(ProxyError::AlreadyClosed(self.config.client.clone()));
        }
        if !self.state.is_current(term) {
            return Err(self
                .not_current_leader("leadership term changed during the call", None)
                .into());
        }
        Ok(value)
    }

    fn handle_delegate_failure<E>(self: &Arc<Self>, term: &Arc<Term<D>>, e: E) -> ProxyError<E>
    where
        E: ClassifyFailure,
    {
        match e.failure_kind() {
            FailureKind::NotLeading => self.mark_not_leading(term, Some(e.to_string())).into(),
            FailureKind::Interrupted if !self.state.is_current(term) => self
                .not_current_leader(
                    "received an interrupt due to leader election",
                    Some(e.to_string()),
                )
                .into(),
            _ => ProxyError::Delegate(e),
        }
    }

    /// End `term` and, if this call ended it, start acquiring again.
    fn mark_not_leading(self: &Arc<Self>, term: &Arc<Term<D>>, cause: Option<String>) -> NotCurrentLeader {
        tracing::warn!(
            client = %self.config.client,
            term = term.token().term(),
            generation = term.generation(),
            cause = ?cause,
            "Lost leadership"
        );
        if self.state.invalidate(term) && !self.state.is_closed() {
            self.try_to_gain_leadership();
        }
        self.not_current_leader("method invoked on a non-leader (leadership lost)", cause)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ProxyConfig;
    use crate::delegate::Delegate;
    use crate::election::{HostAndPort, LocalElection, StillLeadingStatus};
    use crate::error::{BoxError, NotCurrentLeader, ProxyError};
    use crate::executor::ProxyExecutors;
    use crate::proxy::LeadershipProxy;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Store {
        closes: Arc<AtomicUsize>,
    }

    impl Delegate for Store {
        fn close(&self) -> Result<(), BoxError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(client: &str) -> ProxyConfig {
        ProxyConfig::for_client(client)
            .with_max_no_quorum_attempts(3)
            .with_status_retry_delay(Duration::from_millis(1))
            .with_gain_leadership_backoff(Duration::from_millis(5))
            .with_construction_backoff(Duration::from_millis(1))
    }

    fn leading_proxy(
        client: &str,
        executors: &ProxyExecutors,
    ) -> (LeadershipProxy<Store>, Arc<LocalElection>, Arc<AtomicUsize>) {
        let election = Arc::new(LocalElection::new());
        election.grant();
        let closes = Arc::new(AtomicUsize::new(0));
        let factory = {
            let closes = Arc::clone(&closes);
            move || {
                Ok::<_, BoxError>(Store {
                    closes: Arc::clone(&closes),
                })
            }
        };
        let proxy = LeadershipProxy::new(config(client), election.clone(), factory, executors).unwrap();
        (proxy, election, closes)
    }

    #[test]
    fn test_call_success() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, election, _) = leading_proxy("dispatch-ok", &executors);

        let value = proxy.call(|_| Ok::<_, io::Error>(42)).unwrap();

        assert_eq!(value, 42);
        assert_eq!(election.status_checks(), 1);
    }

    #[test]
    fn test_missing_token_carries_hint() {
        let executors = ProxyExecutors::new(1).unwrap();
        let election = Arc::new(LocalElection::new());
        election.set_leader_hint(Some(HostAndPort::new("10.0.0.9", 8421)));
        let proxy =
            LeadershipProxy::new(config("dispatch-hint"), election.clone(), || Ok::<_, BoxError>(Store::default()), &executors)
                .unwrap();

        let err = proxy.call(|_| Ok::<_, io::Error>(())).unwrap_err();
        let not_leader = err.as_not_current_leader().unwrap();
        assert_eq!(not_leader.message(), "method invoked on a non-leader");
        assert_eq!(not_leader.leader_hint(), Some(&HostAndPort::new("10.0.0.9", 8421)));
        assert_eq!(election.status_checks(), 0);
    }

    #[test]
    fn test_business_error_passes_through() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, _, closes) = leading_proxy("dispatch-business", &executors);

        let err = proxy
            .call(|_| Err::<(), _>(io::Error::new(io::ErrorKind::InvalidInput, "bad lock id")))
            .unwrap_err();

        match err {
            ProxyError::Delegate(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            other => panic!("expected delegate error, got {other:?}"),
        }
        assert!(proxy.current_token().is_some(), "business errors keep the term");
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delegate_not_leading_signal_ends_term() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, election, closes) = leading_proxy("dispatch-signal", &executors);
        let old = proxy.current_token().unwrap();

        let err = proxy
            .call(|_| Err::<(), _>(NotCurrentLeader::new("paxos lost")))
            .unwrap_err();

        let not_leader = err.as_not_current_leader().unwrap();
        assert_eq!(not_leader.message(), "method invoked on a non-leader (leadership lost)");
        assert!(not_leader.cause().unwrap().contains("paxos lost"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        // Still leading per the election, so the fast path republishes at once.
        let new = proxy.current_token().unwrap();
        assert_eq!(new, old, "same election token, new term");
        assert_eq!(election.blocking_waits(), 0);
    }

    #[test]
    fn test_interrupt_without_term_change_is_delegate_error() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, _, _) = leading_proxy("dispatch-interrupt", &executors);

        let err = proxy
            .call(|_| Err::<(), _>(io::Error::from(io::ErrorKind::Interrupted)))
            .unwrap_err();

        assert!(matches!(err, ProxyError::Delegate(_)));
    }

    #[test]
    fn test_interrupt_after_term_change_is_not_current_leader() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, election, closes) = leading_proxy("dispatch-interrupt-lost", &executors);

        let err = proxy
            .call(|_| {
                election.revoke();
                // Another call on the same term hears of the loss and ends it.
                let ended = proxy.call(|_| Err::<(), _>(NotCurrentLeader::new("lease gone")));
                assert!(ended.unwrap_err().is_retryable());
                Err::<(), _>(io::Error::new(io::ErrorKind::Interrupted, "operation interrupted"))
            })
            .unwrap_err();

        let not_leader = err.as_not_current_leader().unwrap();
        assert_eq!(not_leader.message(), "received an interrupt due to leader election");
        assert_eq!(not_leader.cause(), Some("operation interrupted"));
        assert_eq!(closes.load(Ordering::SeqCst), 1, "only the second call released the term");
        assert!(proxy.current_token().is_none());
    }

    #[test]
    fn test_no_quorum_resolves_to_not_leading() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, election, closes) = leading_proxy("dispatch-noquorum", &executors);
        election.set_status_override(Some(StillLeadingStatus::NoQuorum));

        let err = proxy.call(|_| Ok::<_, io::Error>("done")).unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(election.status_checks(), 3);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_async_success() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, _, _) = leading_proxy("dispatch-async", &executors);

        let value = proxy
            .call_async(|_store| async { Ok::<_, io::Error>("locked") })
            .await
            .unwrap();

        assert_eq!(value, "locked");
    }

    #[tokio::test]
    async fn test_call_async_delegate_error() {
        let executors = ProxyExecutors::new(1).unwrap();
        let (proxy, _, _) = leading_proxy("dispatch-async-err", &executors);

        let err = proxy
            .call_async(|_store| async { Err::<(), _>(io::Error::other("conflict")) })
            .await
            .unwrap_err();

        assert_eq!(err.into_delegate().unwrap().to_string(), "conflict");
    }
}
