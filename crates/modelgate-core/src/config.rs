//! Gateway configuration, loaded from environment variables at startup.

use std::str::FromStr;
use std::time::Duration;

/// Which inference platform the gateway fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Kserve,
    /// In-cluster plugin deployment; accepts the legacy `k8s-plugin` alias.
    #[strum(to_string = "k8s", serialize = "k8s-plugin")]
    K8s,
    Replicate,
    Runpod,
}

/// Runtime configuration for the gateway.
///
/// Every field has a default so the server comes up without any environment
/// variables set, except the addresses of its collaborators.
#[derive(Debug, Clone)]
pub struct Config {
    /// `development` enables pretty log output.
    pub environment: String,

    /// TCP address the HTTP surface binds (default: `"0.0.0.0:8080"`).
    pub bind_address: String,

    /// Redis connection URL backing the durable work queue.
    pub redis_url: String,

    /// `true` when the Redis instance is private to this process (e.g. a
    /// local sidecar).  Only then is the shutdown drain allowed to run.
    pub queue_private: bool,

    /// Seconds to wait before draining a private queue on shutdown.
    pub shutdown_delay: u64,

    /// Number of concurrent task-processor workers.
    pub worker_concurrency: usize,

    /// Admission-control bound: `scheduled + pending + retry` at or above
    /// this rejects new asynchronous work.  Also the page size for queue
    /// list operations.
    pub max_queue_size: usize,

    /// Per-task deadline in seconds; bounds backend invocation, queue entry
    /// timeout and the stale-status sweep's wait interval.
    pub task_timeout: u64,

    /// Model served by this gateway instance; scopes the stale-status sweep.
    pub model_name: String,

    /// Record-store service address (`host:port`).
    pub record_store_address: String,

    /// API key sent with every record-store request.
    pub record_store_api_key: String,

    /// Selected inference platform.
    pub ml_platform: Option<Platform>,

    /// Upload webhook advertised to KServe-style backends, when set.
    pub upload_webhook_address: Option<String>,

    /// Gate for the 30-minute reconciliation loop.
    pub enable_periodic_check: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    // ── KServe ───────────────────────────────────────────────────────────
    pub kserve_address: String,
    pub kserve_custom_domain: String,
    pub kserve_namespace: String,
    pub kserve_version: String,
    pub kserve_request_timeout: u64,

    // ── K8s plugin ───────────────────────────────────────────────────────
    pub k8s_plugin_address: String,
    pub k8s_plugin_request_timeout: u64,

    // ── Replicate ────────────────────────────────────────────────────────
    pub replicate_address: String,
    pub replicate_api_key: String,
    pub replicate_model_id: String,
    pub replicate_request_timeout: u64,

    // ── RunPod ───────────────────────────────────────────────────────────
    pub runpod_address: String,
    pub runpod_api_key: String,
    pub runpod_model_id: String,
    pub runpod_request_timeout: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            environment: env_or("MG_ENVIRONMENT", "production"),
            bind_address: env_or("MG_BIND", "0.0.0.0:8080"),
            redis_url: env_or("MG_REDIS_URL", "redis://127.0.0.1:6379"),
            queue_private: bool_env("MG_QUEUE_PRIVATE"),
            shutdown_delay: parse_env("MG_SHUTDOWN_DELAY", 0),
            worker_concurrency: parse_env("MG_WORKER_CONCURRENCY", 4),
            max_queue_size: parse_env("MG_MAX_QUEUE_SIZE", 32),
            task_timeout: parse_env("MG_TASK_TIMEOUT", 600),
            model_name: env_or("MG_MODEL_NAME", ""),
            record_store_address: env_or("MG_RECORD_STORE_ADDRESS", "127.0.0.1:9000"),
            record_store_api_key: env_or("MG_RECORD_STORE_APIKEY", ""),
            ml_platform: std::env::var("MG_ML_PLATFORM")
                .ok()
                .and_then(|v| Platform::from_str(&v).ok()),
            upload_webhook_address: std::env::var("MG_UPLOAD_WEBHOOK_ADDRESS").ok(),
            enable_periodic_check: bool_env("MG_ENABLE_PERIODIC_CHECK"),
            log_level: env_or("MG_LOG", "info"),
            log_json: bool_env("MG_LOG_JSON"),

            kserve_address: env_or("MG_KSERVE_ADDRESS", ""),
            kserve_custom_domain: env_or("MG_KSERVE_CUSTOM_DOMAIN", ""),
            kserve_namespace: env_or("MG_KSERVE_NAMESPACE", ""),
            kserve_version: env_or("MG_KSERVE_VERSION", "0.10.2"),
            kserve_request_timeout: parse_env("MG_KSERVE_REQUEST_TIMEOUT", 300),

            k8s_plugin_address: env_or("MG_K8S_PLUGIN_ADDRESS", ""),
            k8s_plugin_request_timeout: parse_env("MG_K8S_PLUGIN_REQUEST_TIMEOUT", 300),

            replicate_address: env_or("MG_REPLICATE_ADDRESS", ""),
            replicate_api_key: env_or("MG_REPLICATE_APIKEY", ""),
            replicate_model_id: env_or("MG_REPLICATE_MODEL_ID", ""),
            replicate_request_timeout: parse_env("MG_REPLICATE_REQUEST_TIMEOUT", 300),

            runpod_address: env_or("MG_RUNPOD_ADDRESS", ""),
            runpod_api_key: env_or("MG_RUNPOD_APIKEY", ""),
            runpod_model_id: env_or("MG_RUNPOD_MODEL_ID", ""),
            runpod_request_timeout: parse_env("MG_RUNPOD_REQUEST_TIMEOUT", 300),
        }
    }

    /// Startup pre-check: a task must never outlive its queue timeout, and
    /// an admission bound below 1 admits nothing.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_size < 1 {
            return Err("MG_MAX_QUEUE_SIZE must be > 0".to_owned());
        }
        let platform_timeout = self
            .kserve_request_timeout
            .max(self.k8s_plugin_request_timeout)
            .max(self.replicate_request_timeout)
            .max(self.runpod_request_timeout);
        if self.task_timeout < platform_timeout {
            return Err(format!(
                "MG_TASK_TIMEOUT ({}) must be >= every platform request timeout ({})",
                self.task_timeout, platform_timeout
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn bool_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod test {
    use super::*;

    fn base() -> Config {
        Config {
            environment: "test".into(),
            bind_address: "127.0.0.1:0".into(),
            redis_url: String::new(),
            queue_private: true,
            shutdown_delay: 0,
            worker_concurrency: 1,
            max_queue_size: 4,
            task_timeout: 600,
            model_name: "test-model".into(),
            record_store_address: String::new(),
            record_store_api_key: String::new(),
            ml_platform: None,
            upload_webhook_address: None,
            enable_periodic_check: false,
            log_level: "info".into(),
            log_json: false,
            kserve_address: String::new(),
            kserve_custom_domain: String::new(),
            kserve_namespace: String::new(),
            kserve_version: "0.10.2".into(),
            kserve_request_timeout: 300,
            k8s_plugin_address: String::new(),
            k8s_plugin_request_timeout: 300,
            replicate_address: String::new(),
            replicate_api_key: String::new(),
            replicate_model_id: String::new(),
            replicate_request_timeout: 300,
            runpod_address: String::new(),
            runpod_api_key: String::new(),
            runpod_model_id: String::new(),
            runpod_request_timeout: 300,
        }
    }

    #[test]
    fn validate_rejects_zero_queue_bound() {
        let mut cfg = base();
        cfg.max_queue_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_task_timeout_below_platform_timeout() {
        let mut cfg = base();
        cfg.task_timeout = 100;
        cfg.kserve_request_timeout = 300;
        assert!(cfg.validate().is_err());
        cfg.task_timeout = 300;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn platform_names_parse_lowercase() {
        assert_eq!("kserve".parse::<Platform>().unwrap(), Platform::Kserve);
        assert_eq!("replicate".parse::<Platform>().unwrap(), Platform::Replicate);
        assert!("unknown".parse::<Platform>().is_err());
    }

    #[test]
    fn k8s_platform_accepts_both_spellings() {
        assert_eq!("k8s".parse::<Platform>().unwrap(), Platform::K8s);
        assert_eq!("k8s-plugin".parse::<Platform>().unwrap(), Platform::K8s);
        assert_eq!(Platform::K8s.to_string(), "k8s");
    }
}
