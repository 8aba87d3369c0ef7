//! Job subsystem configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::result::ResultLimits;
use crate::jobs::types::RetryPolicy;

/// Tunables for claiming, execution, leases, the worker loop and the status
/// stream.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Identifier stamped on claimed rows.
    pub worker_id: String,
    /// Jobs claimed per worker batch.
    pub batch_size: usize,
    /// Upper bound for manually triggered batches.
    pub max_manual_batch: usize,
    pub default_max_attempts: u32,
    pub handler_timeout: Duration,
    pub retry: RetryPolicy,
    pub result_limits: ResultLimits,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Random extra delay added to each idle poll.
    pub poll_jitter: Duration,
    /// Run the lease reaper every N worker ticks.
    pub reap_every_ticks: u32,
    pub stream_interval: Duration,
    pub stream_max_connections_per_tenant: usize,
    /// Error samples kept per batch report.
    pub error_sample_limit: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            batch_size: 10,
            max_manual_batch: 50,
            default_max_attempts: 3,
            handler_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            result_limits: ResultLimits::default(),
            lease_duration: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            poll_jitter: Duration::from_millis(500),
            reap_every_ticks: 12,
            stream_interval: Duration::from_secs(2),
            stream_max_connections_per_tenant: 5,
            error_sample_limit: 10,
        }
    }
}

impl JobsConfig {
    /// Read `JOBS_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable source.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let lookup = &lookup;

        if let Some(id) = lookup("JOBS_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            cfg.worker_id = id;
        }
        set(lookup, "JOBS_BATCH_SIZE", &mut cfg.batch_size);
        set(lookup, "JOBS_MAX_MANUAL_BATCH", &mut cfg.max_manual_batch);
        set(lookup, "JOBS_DEFAULT_MAX_ATTEMPTS", &mut cfg.default_max_attempts);
        set_secs(lookup, "JOBS_HANDLER_TIMEOUT_SECS", &mut cfg.handler_timeout);
        set_secs(lookup, "JOBS_BACKOFF_BASE_SECS", &mut cfg.retry.base_delay);
        set_secs(lookup, "JOBS_BACKOFF_MAX_SECS", &mut cfg.retry.max_delay);
        set_secs(lookup, "JOBS_CANCEL_RETRY_DELAY_SECS", &mut cfg.retry.cancellation_delay);
        set(lookup, "JOBS_RESULT_MAX_BYTES", &mut cfg.result_limits.max_bytes);
        set(lookup, "JOBS_RESULT_PREVIEW_CHARS", &mut cfg.result_limits.preview_chars);
        set(lookup, "JOBS_RESULT_MAX_KEYS", &mut cfg.result_limits.max_keys);
        set_secs(lookup, "JOBS_LEASE_SECS", &mut cfg.lease_duration);
        set_secs(lookup, "JOBS_HEARTBEAT_SECS", &mut cfg.heartbeat_interval);
        set_secs(lookup, "JOBS_POLL_INTERVAL_SECS", &mut cfg.poll_interval);
        set_millis(lookup, "JOBS_POLL_JITTER_MS", &mut cfg.poll_jitter);
        set(lookup, "JOBS_REAP_EVERY_TICKS", &mut cfg.reap_every_ticks);
        set_secs(lookup, "JOBS_STREAM_INTERVAL_SECS", &mut cfg.stream_interval);
        set(
            lookup,
            "JOBS_STREAM_MAX_CONNECTIONS",
            &mut cfg.stream_max_connections_per_tenant,
        );
        set(lookup, "JOBS_ERROR_SAMPLE_LIMIT", &mut cfg.error_sample_limit);

        cfg.sanitize()
    }

    /// Clamp values that would make the pipeline misbehave.
    fn sanitize(mut self) -> Self {
        self.default_max_attempts = self.default_max_attempts.max(1);
        self.max_manual_batch = self.max_manual_batch.max(1);
        self.reap_every_ticks = self.reap_every_ticks.max(1);
        // Timer intervals must be non-zero.
        self.lease_duration = self.lease_duration.max(Duration::from_secs(3));
        self.stream_interval = self.stream_interval.max(Duration::from_secs(1));
        if self.heartbeat_interval >= self.lease_duration {
            warn!(
                heartbeat = ?self.heartbeat_interval,
                lease = ?self.lease_duration,
                "heartbeat interval not shorter than lease; using a third of the lease"
            );
            self.heartbeat_interval = self.lease_duration / 3;
        }
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_stream_interval(mut self, interval: Duration) -> Self {
        self.stream_interval = interval;
        self
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::now_v7().simple())
}

fn set<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring invalid configuration value"),
    }
}

fn set_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    set(lookup, key, &mut secs);
    *target = Duration::from_secs(secs);
}

fn set_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut millis = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
    set(lookup, key, &mut millis);
    *target = Duration::from_millis(millis);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = JobsConfig::default();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.max_manual_batch, 50);
        assert_eq!(cfg.handler_timeout, Duration::from_secs(300));
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(60));
        assert_eq!(cfg.result_limits.max_bytes, 65_536);
        assert_eq!(cfg.stream_max_connections_per_tenant, 5);
        assert!(cfg.worker_id.starts_with("worker-"));
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_fall_back() {
        let cfg = JobsConfig::from_lookup(lookup(&[
            ("JOBS_BATCH_SIZE", "25"),
            ("JOBS_HANDLER_TIMEOUT_SECS", "30"),
            ("JOBS_STREAM_MAX_CONNECTIONS", "not-a-number"),
            ("JOBS_WORKER_ID", "scan-worker-1"),
        ]));
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.handler_timeout, Duration::from_secs(30));
        assert_eq!(cfg.stream_max_connections_per_tenant, 5);
        assert_eq!(cfg.worker_id, "scan-worker-1");
    }

    #[test]
    fn nonsensical_values_are_clamped() {
        let cfg = JobsConfig::from_lookup(lookup(&[
            ("JOBS_DEFAULT_MAX_ATTEMPTS", "0"),
            ("JOBS_REAP_EVERY_TICKS", "0"),
            ("JOBS_LEASE_SECS", "30"),
            ("JOBS_HEARTBEAT_SECS", "60"),
            ("JOBS_STREAM_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(cfg.default_max_attempts, 1);
        assert_eq!(cfg.reap_every_ticks, 1);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.stream_interval, Duration::from_secs(1));
    }
}
