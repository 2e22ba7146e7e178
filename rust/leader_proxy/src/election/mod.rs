//! Election collaborator interface.
//!
//! The proxy never runs an election itself. It consumes a
//! [`LeaderElection`] implementation that can say whether this process
//! holds the lease, block until it does, and check a token against a
//! quorum of peers.
//!
//! # Tokens
//!
//! A [`LeadershipToken`] identifies one leadership *term*. Tokens compare
//! by identity: a token minted for a later acquisition is never equal to
//! an earlier one, even if the underlying protocol reuses the term number.

mod local;

pub use local::LocalElection;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ElectionError;

/// Opaque handle for one leadership term.
#[derive(Clone)]
pub struct LeadershipToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    term: u64,
}

impl LeadershipToken {
    /// Mint a fresh token. Every call yields a distinct identity.
    pub fn new(term: u64) -> Self {
        Self {
            inner: Arc::new(TokenInner { term }),
        }
    }

    /// Term number reported by the election protocol. Informational only.
    pub fn term(&self) -> u64 {
        self.inner.term
    }
}

impl PartialEq for LeadershipToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for LeadershipToken {}

impl fmt::Debug for LeadershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipToken")
            .field("term", &self.inner.term)
            .field("id", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl fmt::Display for LeadershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "term-{}", self.inner.term)
    }
}

/// Answer to "is this token still leading?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StillLeadingStatus {
    /// A quorum confirmed the token.
    Leading,
    /// A quorum rejected the token.
    NotLeading,
    /// No majority answered. Retried, then treated as `NotLeading`.
    NoQuorum,
}

impl StillLeadingStatus {
    /// Whether the answer is definitive (anything but `NoQuorum`).
    pub fn is_conclusive(self) -> bool {
        self != StillLeadingStatus::NoQuorum
    }
}

/// Network location of a peer, used to hint callers at the likely leader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAndPort {
    /// Hostname or IP literal.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl HostAndPort {
    /// Create a new host/port pair.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HostAndPort {
    type Err = String;

    /// Parse from "host:port" format. IPv6 literals use brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected 'host:port', got '{}'", s))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("empty host in '{}'", s));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port: '{}'", port))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The leader-election service a proxy waits on.
///
/// Implementations are shared between every proxy in the process, so all
/// methods take `&self`.
#[async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    /// The current token if this process is leading right now. Must not block.
    fn current_token_if_leading(&self) -> Option<LeadershipToken>;

    /// Wait until this process wins a lease.
    ///
    /// Dropping the returned future abandons the wait.
    async fn block_on_becoming_leader(&self) -> Result<LeadershipToken, ElectionError>;

    /// Ask a quorum whether `token` still identifies the live term.
    async fn is_still_leading(
        &self,
        token: &LeadershipToken,
    ) -> Result<StillLeadingStatus, ElectionError>;

    /// Best-effort: a peer recently seen acting as leader.
    fn recently_pinged_leader(&self) -> Option<HostAndPort> {
        None
    }
}
