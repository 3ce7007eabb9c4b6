use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::engine::retry::{Jitter, RetryPolicy};

/// Number of leading hex characters of a fingerprint used as the shard directory.
pub const SHARD_PREFIX_LEN: usize = 2;

/// Prefix of the caller-visible content name (`files/<fingerprint>`).
pub const CONTENT_NAME_PREFIX: &str = "files/";

/// Status code a worker uses to acknowledge a cancelled task.
pub const CANCELLED_STATUS: u16 = 499;

/// Capacity of the worker event bus before slow subscribers start lagging.
pub const WORKER_EVENT_CAPACITY: usize = 256;

/// Operation name of a replication dispatch.
pub const UPLOAD_OPERATION: &str = "uploadFile";

/// Operation name of a best-effort remote deletion.
pub const DELETE_OPERATION: &str = "deleteFile";

/// Top-level configuration for the relay engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the content-addressed input cache.
    pub content_dir: String,
    /// Base URL workers use to download cached content from this process.
    pub public_base_url: String,
    /// Deadline for a unary task's terminal response.
    pub request_timeout_ms: u64,
    /// Maximum gap between two events of a streaming task.
    pub stream_idle_timeout_ms: u64,
    /// Deadline for a single replication transfer.
    pub upload_timeout_ms: u64,
    /// Interval between health probe rounds.
    pub health_interval_ms: u64,
    /// How long a worker has to acknowledge a probe.
    pub probe_timeout_ms: u64,
    /// Probes sent before an unanswering worker is marked unhealthy.
    pub probe_attempts: u32,
    /// Consecutive observed failures before a worker is marked unhealthy.
    pub failure_threshold: u32,
    /// Minimum age before cached content becomes eligible for eviction.
    pub content_ttl_ms: u64,
    /// Number of most recently used entries that are never evicted.
    pub content_capacity: usize,
    /// Interval between eviction sweeps.
    pub sweep_interval_ms: u64,
    /// Estimated lifetime of a remote copy before upstream expires it.
    pub upstream_ttl_ms: u64,
    /// Lifetime of a one-time content download grant.
    pub grant_ttl_ms: u64,
    /// Maximum distinct content references in a single task.
    pub max_references: usize,
    /// Maximum concurrent background replication transfers.
    pub background_concurrency: usize,
    /// Buffered events per streaming task.
    pub stream_buffer: usize,
    /// Transfer attempts per replication (integrity failures are retried).
    pub upload_attempts: u32,
    /// Base delay between replication attempts.
    pub retry_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_dir: "./content_cache".to_string(),
            public_base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_ms: 600_000,
            stream_idle_timeout_ms: 600_000,
            upload_timeout_ms: 300_000,
            health_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
            probe_attempts: 2,
            failure_threshold: 3,
            content_ttl_ms: 48 * 60 * 60 * 1000,
            content_capacity: 256,
            sweep_interval_ms: 10 * 60 * 1000,
            upstream_ttl_ms: 47 * 60 * 60 * 1000,
            grant_ttl_ms: 5 * 60 * 1000,
            max_references: 16,
            background_concurrency: 4,
            stream_buffer: 64,
            upload_attempts: 2,
            retry_base_delay_ms: 200,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.content_dir.trim().is_empty() {
            return Err(anyhow!("content_dir must not be empty"));
        }
        let timings = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("stream_idle_timeout_ms", self.stream_idle_timeout_ms),
            ("upload_timeout_ms", self.upload_timeout_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("grant_ttl_ms", self.grant_ttl_ms),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(anyhow!("{} must be > 0", name));
            }
        }
        if self.max_references == 0 {
            return Err(anyhow!("max_references must be > 0"));
        }
        if self.background_concurrency == 0 {
            return Err(anyhow!("background_concurrency must be > 0"));
        }
        if self.stream_buffer == 0 {
            return Err(anyhow!("stream_buffer must be > 0"));
        }
        if self.upload_attempts == 0 || self.probe_attempts == 0 {
            return Err(anyhow!("upload_attempts and probe_attempts must be > 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn content_ttl(&self) -> Duration {
        Duration::from_millis(self.content_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn upstream_ttl(&self) -> Duration {
        Duration::from_millis(self.upstream_ttl_ms)
    }

    pub fn grant_ttl(&self) -> Duration {
        Duration::from_millis(self.grant_ttl_ms)
    }

    /// Retry policy applied to replication transfers.
    pub fn upload_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upload_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_base_delay_ms.saturating_mul(8)),
            factor: 2.0,
            jitter: Jitter::Equal,
        }
    }

    /// Retry policy applied to unanswered health probes.
    pub fn probe_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.probe_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: self.probe_timeout(),
            factor: 2.0,
            jitter: Jitter::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = EngineConfig {
            probe_timeout_ms: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("probe_timeout_ms"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"content_dir": "/tmp/x", "max_references": 4}"#).unwrap();
        assert_eq!(config.content_dir, "/tmp/x");
        assert_eq!(config.max_references, 4);
        assert_eq!(config.failure_threshold, 3);
    }
}
