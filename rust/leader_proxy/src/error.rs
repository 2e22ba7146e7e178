//! Error types for the leadership proxy.

use thiserror::Error;

use crate::election::HostAndPort;

/// Boxed error used for delegate construction and close failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The caller's leadership context is gone.
///
/// Raised when a call arrives without a valid token, when staleness is
/// detected around the call, or when the delegate itself reports that it
/// is not authoritative. Always safe to retry, possibly against the
/// hinted leader.
#[derive(Debug, Clone, Error)]
#[error("not current leader: {message}, leader hint: {leader_hint:?}")]
pub struct NotCurrentLeader {
    message: String,
    leader_hint: Option<HostAndPort>,
    cause: Option<String>,
}

impl NotCurrentLeader {
    /// Create an error without a leader hint.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            leader_hint: None,
            cause: None,
        }
    }

    /// Attach a hint pointing at a recently observed leader.
    pub fn with_leader_hint(mut self, hint: Option<HostAndPort>) -> Self {
        self.leader_hint = hint;
        self
    }

    /// Attach the rendered cause that triggered the leadership loss.
    pub fn with_cause(mut self, cause: Option<String>) -> Self {
        self.cause = cause;
        self
    }

    /// Human-readable reason.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Another node that was recently seen acting as leader, if known.
    pub fn leader_hint(&self) -> Option<&HostAndPort> {
        self.leader_hint.as_ref()
    }

    /// What triggered the loss of leadership, if anything specific did.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }
}

/// Errors reported by an election collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElectionError {
    /// The blocking wait was interrupted.
    #[error("interrupted while waiting for leadership")]
    Interrupted,

    /// Peers could not be reached.
    #[error("election service unavailable: {0}")]
    Unavailable(String),

    /// Any other failure of the election protocol.
    #[error("election error: {0}")]
    Other(String),
}

/// Errors from the proxy's executors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The executor no longer accepts work.
    #[error("executor {name} is shut down")]
    Shutdown {
        /// Name of the executor thread.
        name: String,
    },

    /// A submitted task was dropped before producing a result.
    #[error("task on executor {name} was dropped before completing")]
    TaskLost {
        /// Name of the executor thread.
        name: String,
    },

    /// A blocking wait was attempted on a thread driving a single-threaded
    /// async runtime, which would stall every task on it.
    #[error("cannot block on {name} from a current-thread async runtime")]
    BlockedInRuntime {
        /// What the caller would have waited for.
        name: String,
    },

    /// The executor thread or runtime could not be started.
    #[error("failed to start executor {name}: {reason}")]
    Spawn {
        /// Name of the executor thread.
        name: String,
        /// Rendered I/O error.
        reason: String,
    },
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Terminal failure of an [`AsyncRetrier`](crate::retry::AsyncRetrier) run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// The last attempt failed and the budget is spent.
    #[error("last attempt failed: {0}")]
    Attempt(E),

    /// The attempt executor shut down.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The run was cancelled.
    #[error("retry cancelled")]
    Cancelled,
}

/// Failure of a call made through a [`LeadershipProxy`](crate::LeadershipProxy).
///
/// `E` is the delegate's own error type, passed through untouched when it
/// carries no leadership signal.
#[derive(Debug, Error)]
pub enum ProxyError<E> {
    /// No valid leadership term for this call. Retryable.
    #[error(transparent)]
    NotCurrentLeader(#[from] NotCurrentLeader),

    /// The proxy has been closed.
    #[error("leadership proxy for client {0} is closed")]
    AlreadyClosed(String),

    /// The delegate failed with a business error.
    #[error("delegate error: {0}")]
    Delegate(#[source] E),

    /// The executor serving this proxy is gone.
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl<E> ProxyError<E> {
    /// Whether retrying the call (possibly elsewhere) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::NotCurrentLeader(_))
    }

    /// The leadership error, if this is one.
    pub fn as_not_current_leader(&self) -> Option<&NotCurrentLeader> {
        match self {
            ProxyError::NotCurrentLeader(e) => Some(e),
            _ => None,
        }
    }

    /// The delegate's error, if this is one.
    pub fn into_delegate(self) -> Option<E> {
        match self {
            ProxyError::Delegate(e) => Some(e),
            _ => None,
        }
    }
}
