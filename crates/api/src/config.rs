//! API process configuration, read from the environment.

use std::fmt;
use std::net::SocketAddr;

use tracing::warn;

use costwise_infra::config::JobsConfig;

/// Internal trigger secrets shorter than this disable the endpoint.
pub const MIN_INTERNAL_SECRET_LEN: usize = 32;

const DEV_JWT_SECRET: &str = "dev-secret";

#[derive(Clone)]
pub struct ApiConfig {
    pub jwt_secret: String,
    /// Shared secret for `POST /internal/jobs/run`.
    pub internal_secret: Option<String>,
    pub database_url: Option<String>,
    /// Use Postgres instead of the in-memory job store.
    pub use_persistent_stores: bool,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    /// Run a background worker loop inside the API process.
    pub run_worker: bool,
    pub jobs: JobsConfig,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("jwt_secret", &"<redacted>")
            .field("internal_secret", &self.internal_secret.as_ref().map(|_| "<redacted>"))
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("use_persistent_stores", &self.use_persistent_stores)
            .field("database_max_connections", &self.database_max_connections)
            .field("bind_addr", &self.bind_addr)
            .field("run_worker", &self.run_worker)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = non_empty("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let bind_addr = match non_empty("BIND_ADDR").map(|raw| raw.trim().parse::<SocketAddr>()) {
            Some(Ok(addr)) => addr,
            Some(Err(err)) => {
                warn!(error = %err, "ignoring invalid BIND_ADDR");
                default_bind_addr()
            }
            None => default_bind_addr(),
        };

        let database_max_connections = non_empty("DATABASE_MAX_CONNECTIONS")
            .and_then(|raw| match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    warn!(value = %raw, "ignoring invalid DATABASE_MAX_CONNECTIONS");
                    None
                }
            })
            .unwrap_or(10);

        Self {
            jwt_secret,
            internal_secret: non_empty("JOBS_INTERNAL_SECRET"),
            database_url: non_empty("DATABASE_URL"),
            use_persistent_stores: flag(&lookup, "USE_PERSISTENT_STORES", false),
            database_max_connections,
            bind_addr,
            run_worker: flag(&lookup, "JOBS_RUN_WORKER", true),
            jobs: JobsConfig::from_lookup(&lookup),
        }
    }

    /// The internal trigger secret, if it is long enough to be accepted.
    pub fn usable_internal_secret(&self) -> Option<&str> {
        self.internal_secret
            .as_deref()
            .filter(|secret| secret.len() >= MIN_INTERNAL_SECRET_LEN)
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %v, "ignoring invalid boolean flag");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

    fn config(pairs: &[(&str, &str)]) -> ApiConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.jwt_secret, DEV_JWT_SECRET);
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(!cfg.use_persistent_stores);
        assert!(cfg.run_worker);
        assert!(cfg.internal_secret.is_none());
        assert_eq!(cfg.jobs.batch_size, 10);
    }

    #[test]
    fn reads_overrides_and_nested_jobs_settings() {
        let cfg = config(&[
            ("JWT_SECRET", "s3cret"),
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/costwise"),
            ("JOBS_RUN_WORKER", "0"),
            ("JOBS_BATCH_SIZE", "25"),
        ]);
        assert_eq!(cfg.jwt_secret, "s3cret");
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert!(cfg.use_persistent_stores);
        assert!(!cfg.run_worker);
        assert_eq!(cfg.jobs.batch_size, 25);
    }

    #[test]
    fn short_internal_secret_is_not_usable() {
        let short = config(&[("JOBS_INTERNAL_SECRET", "too-short")]);
        assert!(short.internal_secret.is_some());
        assert!(short.usable_internal_secret().is_none());

        let long = "x".repeat(MIN_INTERNAL_SECRET_LEN);
        let ok = config(&[("JOBS_INTERNAL_SECRET", long.as_str())]);
        assert_eq!(ok.usable_internal_secret(), Some(long.as_str()));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[("BIND_ADDR", "nowhere"), ("USE_PERSISTENT_STORES", "maybe")]);
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert!(!cfg.use_persistent_stores);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = config(&[("JWT_SECRET", "hunter2"), ("JOBS_INTERNAL_SECRET", "topsecret")]);
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("topsecret"));
    }
}
