//! Proxy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts made for a status check before `NoQuorum` counts as `NotLeading`.
pub const MAX_NO_QUORUM_ATTEMPTS: u32 = 10;
/// Delay between status check attempts.
pub const STATUS_RETRY_DELAY: Duration = Duration::from_millis(700);
/// Delay before re-entering the blocking leadership wait after a failure.
pub const GAIN_LEADERSHIP_BACKOFF: Duration = Duration::from_millis(500);
/// Base delay between failed delegate constructions (jitter is added).
pub const CONSTRUCTION_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for a [`LeadershipProxy`](crate::LeadershipProxy).
///
/// Durations are expressed in milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Logical client / tenant name. Picks the executor shard and labels logs.
    pub client: String,

    /// Status check attempts per call.
    pub max_no_quorum_attempts: u32,

    /// Delay between status check attempts.
    #[serde(with = "duration_ms", rename = "status_retry_delay_ms")]
    pub status_retry_delay: Duration,

    /// Backoff after the blocking leadership wait fails.
    #[serde(with = "duration_ms", rename = "gain_leadership_backoff_ms")]
    pub gain_leadership_backoff: Duration,

    /// Base backoff after a failed delegate construction.
    #[serde(with = "duration_ms", rename = "construction_backoff_ms")]
    pub construction_backoff: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client: "default".to_string(),
            max_no_quorum_attempts: MAX_NO_QUORUM_ATTEMPTS,
            status_retry_delay: STATUS_RETRY_DELAY,
            gain_leadership_backoff: GAIN_LEADERSHIP_BACKOFF,
            construction_backoff: CONSTRUCTION_BACKOFF,
        }
    }
}

impl ProxyConfig {
    /// Default configuration for `client`.
    pub fn for_client(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON string. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the status check budget.
    pub fn with_max_no_quorum_attempts(mut self, attempts: u32) -> Self {
        self.max_no_quorum_attempts = attempts;
        self
    }

    /// Set the delay between status check attempts.
    pub fn with_status_retry_delay(mut self, delay: Duration) -> Self {
        self.status_retry_delay = delay;
        self
    }

    /// Set the backoff after a failed leadership wait.
    pub fn with_gain_leadership_backoff(mut self, backoff: Duration) -> Self {
        self.gain_leadership_backoff = backoff;
        self
    }

    /// Set the base backoff after a failed delegate construction.
    pub fn with_construction_backoff(mut self, backoff: Duration) -> Self {
        self.construction_backoff = backoff;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_no_quorum_attempts, 10);
        assert_eq!(config.status_retry_delay, Duration::from_millis(700));
        assert_eq!(config.gain_leadership_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_partial_json() {
        let config =
            ProxyConfig::from_json(r#"{"client":"tenant-7","status_retry_delay_ms":25}"#).unwrap();
        assert_eq!(config.client, "tenant-7");
        assert_eq!(config.status_retry_delay, Duration::from_millis(25));
        assert_eq!(config.max_no_quorum_attempts, MAX_NO_QUORUM_ATTEMPTS);
        assert_eq!(config.construction_backoff, CONSTRUCTION_BACKOFF);
    }

    #[test]
    fn test_json_uses_millis() {
        let config = ProxyConfig::for_client("timelock")
            .with_gain_leadership_backoff(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["gain_leadership_backoff_ms"], 1500);
        assert_eq!(ProxyConfig::from_json(&json.to_string()).unwrap(), config);
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        assert!(ProxyConfig::from_json(r#"{"max_no_quorum_attempts":"ten"}"#).is_err());
    }
}
