//! Bounded asynchronous retry of a polling operation.
//!
//! [`AsyncRetrier`] starts an attempt on an executor shard, inspects the
//! outcome, and if it is not conclusive sleeps on the [`RetryScheduler`]
//! before trying again, up to a fixed number of attempts. No caller
//! thread is ever parked by it.
//!
//! The proxy uses it to ask "am I still leading?" until the answer is not
//! `NoQuorum`, but nothing here is specific to leadership.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::{ExecutorError, RetryError};
use crate::executor::{BlockingWait, RetryScheduler, SingleThreadExecutor};

type DonePredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Retries an operation until `is_done` accepts its output or the budget is spent.
pub struct AsyncRetrier<T> {
    max_attempts: u32,
    delay: Duration,
    scheduler: Handle,
    executor: Arc<SingleThreadExecutor>,
    is_done: DonePredicate<T>,
}

impl<T: Send + 'static> AsyncRetrier<T> {
    /// Create a retrier.
    ///
    /// `max_attempts` counts the first attempt; zero is treated as one.
    pub fn new<P>(
        max_attempts: u32,
        delay: Duration,
        scheduler: &RetryScheduler,
        executor: Arc<SingleThreadExecutor>,
        is_done: P,
    ) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            scheduler: scheduler.handle().clone(),
            executor,
            is_done: Arc::new(is_done),
        }
    }

    /// Attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start retrying `attempt`.
    ///
    /// The handle resolves to the first outcome accepted by `is_done`, or
    /// to the last outcome once the budget is spent. Failed attempts are
    /// retried like rejected outcomes.
    pub fn execute<E, F, Fut>(&self, attempt: F) -> RetryHandle<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let run = RetryRun {
            attempt: Arc::new(attempt),
            max_attempts: self.max_attempts,
            delay: self.delay,
            executor: Arc::clone(&self.executor),
            is_done: Arc::clone(&self.is_done),
        };
        let task = self.scheduler.spawn(async move {
            let _ = tx.send(run.run().await);
        });
        RetryHandle {
            rx,
            abort: task.abort_handle(),
        }
    }
}

struct RetryRun<T, F> {
    attempt: Arc<F>,
    max_attempts: u32,
    delay: Duration,
    executor: Arc<SingleThreadExecutor>,
    is_done: DonePredicate<T>,
}

impl<T, F> RetryRun<T, F>
where
    T: Send + 'static,
{
    async fn run<E, Fut>(self) -> Result<T, RetryError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Send + 'static,
    {
        let mut attempt_no = 1;
        loop {
            let attempt = Arc::clone(&self.attempt);
            let outcome = self
                .executor
                .submit(move || attempt())?
                .await
                .map_err(|_| ExecutorError::TaskLost {
                    name: self.executor.name().to_string(),
                })?;

            let last = attempt_no >= self.max_attempts;
            match outcome {
                Ok(value) if last || (self.is_done)(&value) => return Ok(value),
                Err(e) if last => return Err(RetryError::Attempt(e)),
                Ok(_) => {
                    tracing::debug!(
                        attempt = attempt_no,
                        max_attempts = self.max_attempts,
                        "Inconclusive attempt, retrying"
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        attempt = attempt_no,
                        max_attempts = self.max_attempts,
                        "Attempt failed, retrying"
                    );
                }
            }

            tokio::time::sleep(self.delay).await;
            attempt_no += 1;
        }
    }
}

/// Pending result of an [`AsyncRetrier::execute`] run.
///
/// Dropping the handle does not stop the run; call [`cancel`](Self::cancel).
pub struct RetryHandle<T, E> {
    rx: oneshot::Receiver<Result<T, RetryError<E>>>,
    abort: AbortHandle,
}

impl<T, E> RetryHandle<T, E> {
    /// Stop retrying. The handle then resolves to [`RetryError::Cancelled`]
    /// unless an outcome was already produced.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Block the current thread until the run finishes.
    ///
    /// Inside a multi-thread runtime the worker steps out with
    /// `block_in_place`; a current-thread runtime gets
    /// [`ExecutorError::BlockedInRuntime`] instead of a panic.
    pub fn blocking_wait(self) -> Result<T, RetryError<E>> {
        let wait = BlockingWait::for_current_thread("retry result")?;
        let rx = self.rx;
        wait.run(move || rx.blocking_recv())
            .unwrap_or(Err(RetryError::Cancelled))
    }
}

impl<T, E> Future for RetryHandle<T, E> {
    type Output = Result<T, RetryError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RetryError::Cancelled)))
    }
}

/// `base` plus deterministic jitter of 0-20% keyed by `attempt`.
///
/// Spreads retries of many proxies without needing a random source.
pub fn jittered(base: Duration, attempt: u32) -> Duration {
    let jitter_frac = (u64::from(attempt).wrapping_mul(37) % 200) as f64 / 1000.0;
    base + base.mul_f64(jitter_frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn retrier<T: Send + 'static>(
        max_attempts: u32,
        is_done: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> (AsyncRetrier<T>, RetryScheduler) {
        let scheduler = RetryScheduler::new().unwrap();
        let executor = Arc::new(SingleThreadExecutor::new("retry-test").unwrap());
        let retrier = AsyncRetrier::new(
            max_attempts,
            Duration::from_millis(2),
            &scheduler,
            executor,
            is_done,
        );
        (retrier, scheduler)
    }

    fn counting(
        calls: &Arc<AtomicU32>,
        outcome: impl Fn(u32) -> Result<u32, String> + Send + Sync + 'static,
    ) -> impl Fn() -> std::future::Ready<Result<u32, String>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(outcome(n))
        }
    }

    #[test]
    fn test_stops_on_first_conclusive_outcome() {
        let (retrier, _scheduler) = retrier(10, |v: &u32| *v >= 3);
        let calls = Arc::new(AtomicU32::new(0));

        let value = assert_ok!(retrier.execute(counting(&calls, Ok)).blocking_wait());

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_budget_yields_last_outcome() {
        let (retrier, _scheduler) = retrier(10, |_: &u32| false);
        let calls = Arc::new(AtomicU32::new(0));

        let value = assert_ok!(retrier.execute(counting(&calls, Ok)).blocking_wait());

        assert_eq!(value, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10, "exactly the budget");
    }

    #[test]
    fn test_errors_are_retried_then_surfaced() {
        let (retrier, _scheduler) = retrier(4, |_: &u32| true);
        let calls = Arc::new(AtomicU32::new(0));

        let err = assert_err!(retrier
            .execute(counting(&calls, |n| Err(format!("attempt {n} failed"))))
            .blocking_wait());

        assert_eq!(err, RetryError::Attempt("attempt 4 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_error_then_success() {
        let (retrier, _scheduler) = retrier(5, |_: &u32| true);
        let calls = Arc::new(AtomicU32::new(0));

        let value = assert_ok!(retrier
            .execute(counting(&calls, |n| if n < 3 {
                Err("flaky".to_string())
            } else {
                Ok(n)
            }))
            .blocking_wait());

        assert_eq!(value, 3);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let (retrier, _scheduler) = retrier(0, |_: &u32| false);
        assert_eq!(retrier.max_attempts(), 1);
        let calls = Arc::new(AtomicU32::new(0));
        assert_ok!(retrier.execute(counting(&calls, Ok)).blocking_wait());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let scheduler = RetryScheduler::new().unwrap();
        let executor = Arc::new(SingleThreadExecutor::new("retry-cancel").unwrap());
        let retrier = AsyncRetrier::new(
            100,
            Duration::from_secs(5),
            &scheduler,
            executor,
            |_: &u32| false,
        );
        let calls = Arc::new(AtomicU32::new(0));

        let handle = retrier.execute(counting(&calls, Ok));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        assert_eq!(handle.await, Err(RetryError::<String>::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempts_run_on_executor() {
        let (retrier, _scheduler) = retrier(1, |_: &Option<String>| true);
        let name = assert_ok!(retrier
            .execute(|| async { Ok::<_, String>(std::thread::current().name().map(str::to_string)) })
            .blocking_wait());
        assert_eq!(name.as_deref(), Some("retry-test"));
    }

    #[test]
    fn test_executor_shutdown_surfaces() {
        let (retrier, _scheduler) = retrier(3, |_: &u32| true);
        retrier.executor.shutdown_and_join();
        let calls = Arc::new(AtomicU32::new(0));
        let err = assert_err!(retrier.execute(counting(&calls, Ok)).blocking_wait());
        assert!(matches!(err, RetryError::Executor(ExecutorError::Shutdown { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_jittered_bounds() {
        let base = Duration::from_millis(100);
        for attempt in 0..50 {
            let delay = jittered(base, attempt);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(20));
        }
        assert_eq!(jittered(base, 0), base);
    }
}
