//! Config schema types.

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub retention: RetentionConfig,
    pub pacing: PacingConfig,
    pub metrics: MetricsConfig,
}

/// Messaging gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the gateway REST API. Defaults to "http://localhost:3000".
    pub base_url: String,
    /// Sent as `X-Api-Key` on every request when set.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    /// Per-request timeout in seconds. Defaults to 15.
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            api_key: None,
            timeout_secs: 15,
        }
    }
}

/// Job database. Locks and account slots live here too so that every worker
/// process sharing the file sees the same state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL. `None` means `<data_dir>/chatrelay.db`.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Worker pool, admission and lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of concurrent workers. Defaults to 10.
    pub workers: usize,
    /// Simultaneous conversations per account. Defaults to 2.
    pub max_concurrent_per_account: u32,
    /// Interval between admission checks while an account is saturated.
    pub admission_poll_ms: u64,
    /// Admission checks before the attempt fails with a timeout.
    pub admission_max_polls: u32,
    /// Per-chat lock lifetime; must outlive the slowest send.
    pub lock_ttl_secs: u64,
    /// Fixed delay before a job that lost the chat lock is retried.
    pub contention_delay_ms: u64,
    /// How long a claimed job may stay in flight before it is considered stalled.
    pub lease_secs: u64,
    /// Upper bound on how long an idle worker sleeps before checking the queue.
    pub idle_poll_ms: u64,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_concurrent_per_account: 2,
            admission_poll_ms: 5_000,
            admission_max_polls: 60,
            lock_ttl_secs: 30,
            contention_delay_ms: 2_000,
            lease_secs: 120,
            idle_poll_ms: 1_000,
            shutdown_grace_secs: 30,
        }
    }
}

/// Retry budget for failed deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first. Defaults to 3.
    pub max_attempts: u32,
    /// First backoff delay; doubles on each following attempt.
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
        }
    }
}

/// How long finished jobs are kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub completed_max_age_secs: u64,
    pub completed_max_count: usize,
    pub failed_max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_max_age_secs: 3_600,
            completed_max_count: 100,
            failed_max_age_secs: 86_400,
            sweep_interval_secs: 60,
        }
    }
}

/// Inclusive millisecond range a random delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// Human-like pacing around sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Pause between marking the chat seen and starting to type / send.
    pub seen_pause: DelayRange,
    /// Texts up to this many characters use `short_typing`.
    pub short_max_chars: usize,
    pub short_typing: DelayRange,
    /// Texts up to this many characters use `medium_typing`.
    pub medium_max_chars: usize,
    pub medium_typing: DelayRange,
    pub long_typing: DelayRange,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            seen_pause: DelayRange::new(0, 2_000),
            short_max_chars: 30,
            short_typing: DelayRange::new(2_000, 5_000),
            medium_max_chars: 150,
            medium_typing: DelayRange::new(4_000, 7_000),
            long_typing: DelayRange::new(5_000, 10_000),
        }
    }
}

impl PacingConfig {
    /// No pauses at all. Handy for tests and bulk replays.
    #[must_use]
    pub fn instant() -> Self {
        let zero = DelayRange::new(0, 0);
        Self {
            seen_pause: zero,
            short_typing: zero,
            medium_typing: zero,
            long_typing: zero,
            ..Self::default()
        }
    }

    /// Longest single pause between two gateway calls of one send.
    #[must_use]
    pub fn longest_pause_ms(&self) -> u64 {
        self.seen_pause
            .max_ms
            .max(self.short_typing.max_ms)
            .max(self.medium_typing.max_ms)
            .max(self.long_typing.max_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled. Defaults to true.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dispatch_policy() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.dispatch.workers, 10);
        assert_eq!(cfg.dispatch.max_concurrent_per_account, 2);
        assert_eq!(cfg.dispatch.lock_ttl_secs, 30);
        assert_eq!(cfg.dispatch.contention_delay_ms, 2_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.backoff_base_ms, 2_000);
        assert_eq!(cfg.retention.completed_max_count, 100);
        assert_eq!(cfg.pacing.short_typing, DelayRange::new(2_000, 5_000));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: RelayConfig = toml::from_str(
            r#"
            [dispatch]
            workers = 4

            [pacing.short_typing]
            min_ms = 100
            max_ms = 200
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dispatch.workers, 4);
        assert_eq!(cfg.dispatch.max_concurrent_per_account, 2);
        assert_eq!(cfg.pacing.short_typing, DelayRange::new(100, 200));
        assert_eq!(cfg.pacing.long_typing, DelayRange::new(5_000, 10_000));
    }

    #[test]
    fn api_key_serializes_exposed() {
        let mut cfg = RelayConfig::default();
        cfg.gateway.api_key = Some(Secret::new("k-123".into()));
        let out = toml::to_string(&cfg).unwrap();
        assert!(out.contains("api_key = \"k-123\""));
    }

    #[test]
    fn longest_pause_is_the_long_typing_window() {
        assert_eq!(PacingConfig::default().longest_pause_ms(), 10_000);
        assert_eq!(PacingConfig::instant().longest_pause_ms(), 0);
    }
}
