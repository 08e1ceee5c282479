//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_NAMESPACE: &str = "agent_queue";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection string.
    pub redis_url: String,
    /// Prefix for every key the queue touches.
    pub namespace: String,
    /// Whether the queue subsystem is enabled at all.
    pub enabled: bool,
    /// Task blobs expire after this long.
    pub task_ttl: Duration,
    /// Result blobs expire after this long.
    pub result_ttl: Duration,
    /// Claim markers expire after this long; a marker that lapses before
    /// the task starts running sends the task back to its queue.
    pub claim_ttl: Duration,
    /// Worker heartbeats expire after this long.
    pub heartbeat_ttl: Duration,
    /// How long `claim_next` waits for work before giving up.
    pub claim_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            enabled: true,
            task_ttl: Duration::from_secs(24 * 3600), // 24 hours
            result_ttl: Duration::from_secs(3600),    // 1 hour
            claim_ttl: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    /// Load configuration from the environment. Unset variables fall back
    /// to defaults; set-but-unparsable values are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            namespace: std::env::var("QUEUE_NAMESPACE").unwrap_or(defaults.namespace),
            enabled: env_bool("USE_TASK_QUEUE")?.unwrap_or(defaults.enabled),
            ..defaults
        })
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker identity. Generated when not supplied.
    pub worker_id: String,
    /// How often the worker refreshes its heartbeat and runs maintenance.
    pub heartbeat_interval: Duration,
    /// Base pause between polls when no work is queued.
    pub idle_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generated_worker_id(),
            heartbeat_interval: Duration::from_secs(30),
            idle_sleep: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            ..defaults
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due scheduled tasks are promoted into their queues.
    pub check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            check_interval: env_secs("SCHEDULER_INTERVAL_SECS")?
                .unwrap_or(defaults.check_interval),
        })
    }
}

fn generated_worker_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    format!("worker-{}", &id[..8])
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    parse_bool(key, &raw).map(Some)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {:?}", raw),
        }),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    parse_secs(key, &raw).map(Some)
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a number of seconds, got {:?}", raw),
    })?;
    Ok(Duration::from_secs(secs))
}
