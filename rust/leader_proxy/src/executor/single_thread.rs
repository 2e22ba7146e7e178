//! A named OS thread driving a current-thread tokio runtime.
//!
//! Jobs are pulled from an unbounded channel and run in submission
//! order. A job may spawn futures; those run as tasks on the same thread,
//! so continuations of one proxy never migrate to another thread.
//!
//! ```text
//! execute(job) ──► mpsc ──► [thread: block_on loop] ──► job() ──► tokio::spawn(fut)
//!                                  ▲
//! shutdown() ──► watch(true) ──────┘  (loop exits, runtime dropped, tasks cancelled)
//! ```

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ExecutorError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-threaded FIFO executor.
pub struct SingleThreadExecutor {
    name: String,
    jobs: mpsc::UnboundedSender<Job>,
    shutdown: watch::Sender<bool>,
    thread_id: ThreadId,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SingleThreadExecutor {
    /// Start the executor thread.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::Spawn {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(thread_name, runtime, jobs_rx, shutdown_rx))
            .map_err(|e| ExecutorError::Spawn {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name,
            jobs: jobs_tx,
            shutdown: shutdown_tx,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` to run on the executor thread.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(self.shutdown_error());
        }
        self.jobs
            .send(Box::new(job))
            .map_err(|_| self.shutdown_error())
    }

    /// Queue `f`; the future it returns runs as a task on the executor thread.
    ///
    /// `f` itself runs in submission order relative to every other job.
    /// The receiver yields the future's output, or an error if the task
    /// was dropped (executor shut down or the future panicked).
    pub fn submit<F, Fut>(&self, f: F) -> Result<oneshot::Receiver<Fut::Output>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let fut = f();
            tokio::spawn(async move {
                let _ = tx.send(fut.await);
            });
        })?;
        Ok(rx)
    }

    /// Run `fut` as a task on the executor thread.
    pub fn spawn<Fut>(&self, fut: Fut) -> Result<oneshot::Receiver<Fut::Output>>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.submit(move || fut)
    }

    /// Stop accepting work and drop queued jobs and running tasks.
    ///
    /// Does not wait for the thread; see [`shutdown_and_join`](Self::shutdown_and_join).
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Shut down and wait for the thread to exit.
    ///
    /// When called from the executor's own thread this only signals.
    pub fn shutdown_and_join(&self) {
        self.shutdown();
        if self.is_current() {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(executor = %self.name, "Executor thread panicked");
            }
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether the caller is running on this executor's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn shutdown_error(&self) -> ExecutorError {
        ExecutorError::Shutdown {
            name: self.name.clone(),
        }
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SingleThreadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleThreadExecutor")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn run(
    name: String,
    runtime: tokio::runtime::Runtime,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(executor = %name, "Executor thread started");
    runtime.block_on(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!(executor = %name, "Job panicked");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(executor = %name, "Executor thread shutting down");
    });
    // Runtime drops here; tasks still in flight are cancelled.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let executor = SingleThreadExecutor::new("test-fifo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            executor
                .execute(move || seen.lock().unwrap().push(i))
                .unwrap();
        }

        let done = executor.spawn(async {}).unwrap();
        done.blocking_recv().unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_submit_runs_on_executor_thread() {
        let executor = SingleThreadExecutor::new("test-thread-name").unwrap();
        let rx = executor
            .submit(|| async { thread::current().name().map(str::to_string) })
            .unwrap();
        assert_eq!(rx.blocking_recv().unwrap().as_deref(), Some("test-thread-name"));
    }

    #[test]
    fn test_spawned_tasks_interleave() {
        let executor = SingleThreadExecutor::new("test-interleave").unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = executor
            .spawn(async move {
                release_rx.await.unwrap();
                "slow"
            })
            .unwrap();
        let fast = executor.spawn(async { "fast" }).unwrap();

        // The second task completes while the first is still parked.
        assert_eq!(fast.blocking_recv().unwrap(), "fast");
        release_tx.send(()).unwrap();
        assert_eq!(slow.blocking_recv().unwrap(), "slow");
    }

    #[test]
    fn test_shutdown_rejects_and_cancels() {
        let executor = SingleThreadExecutor::new("test-shutdown").unwrap();
        let parked = executor
            .spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();

        executor.shutdown_and_join();

        assert!(executor.is_shutdown());
        assert!(parked.blocking_recv().is_err(), "in-flight task must be dropped");
        assert_eq!(
            executor.execute(|| {}).unwrap_err(),
            ExecutorError::Shutdown {
                name: "test-shutdown".into()
            }
        );
    }

    #[test]
    fn test_panicking_job_does_not_kill_executor() {
        let executor = SingleThreadExecutor::new("test-panic").unwrap();
        executor.execute(|| panic!("job failure")).unwrap();
        let rx = executor.spawn(async { 7 }).unwrap();
        assert_eq!(rx.blocking_recv().unwrap(), 7);
    }

    #[test]
    fn test_is_current() {
        let executor = Arc::new(SingleThreadExecutor::new("test-current").unwrap());
        assert!(!executor.is_current());
        let inner = Arc::clone(&executor);
        let rx = executor.submit(move || async move { inner.is_current() }).unwrap();
        assert!(rx.blocking_recv().unwrap());
    }
}
