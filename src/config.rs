use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CronError, Result};

/// Connection settings for the coordination store, shared by worker and master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// etcd endpoints, e.g. `["127.0.0.1:2379"]`
    #[serde(alias = "etcdEndPoints")]
    pub etcd_endpoints: Vec<String>,
    /// Dial timeout for the initial connection
    #[serde(alias = "etcdDialTimeOut")]
    pub etcd_dial_timeout_ms: u64,
    /// Deadline for every unary etcd call once connected
    pub etcd_request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["127.0.0.1:2379".to_string()],
            etcd_dial_timeout_ms: 5000,
            etcd_request_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_request_timeout_ms)
    }
}

/// Worker process configuration.
///
/// Loaded from an optional JSON file (camelCase keys), every field has a
/// default so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Identifier written into lock keys; defaults to a random `worker-<uuid>`
    pub worker_id: String,
    #[serde(flatten)]
    pub store: StoreConfig,
    /// TTL of the lease backing each job lock
    pub lock_ttl_secs: i64,
    /// Upper bound on a single lock acquisition round trip
    pub lock_acquire_timeout_ms: u64,
    /// Scheduler sleep when no job is scheduled
    pub idle_sleep_ms: u64,
    /// Delay before re-subscribing after a broken watch
    pub watch_retry_backoff_ms: u64,
    /// Capacity of the job event channel between sync agent and scheduler
    pub event_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            store: StoreConfig::default(),
            lock_ttl_secs: 5,
            lock_acquire_timeout_ms: 1000,
            idle_sleep_ms: 1000,
            watch_retry_backoff_ms: 1000,
            event_buffer: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.etcd_endpoints.is_empty() {
            return Err(CronError::Config("etcdEndpoints must not be empty".to_string()));
        }
        if self.lock_ttl_secs <= 0 {
            return Err(CronError::Config(format!(
                "lockTtlSecs must be positive, got {}",
                self.lock_ttl_secs
            )));
        }
        if self.event_buffer == 0 {
            return Err(CronError::Config("eventBuffer must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn watch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.watch_retry_backoff_ms)
    }
}

/// Master (management API) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterConfig {
    pub api_port: u16,
    /// Deadline for each store call made on behalf of an API request
    pub api_timeout_ms: u64,
    #[serde(flatten)]
    pub store: StoreConfig,
    /// Lifetime of a kill marker; it only has to outlive the watch round trip
    pub kill_marker_ttl_secs: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            api_port: 8070,
            api_timeout_ms: 5000,
            store: StoreConfig::default(),
            kill_marker_ttl_secs: 1,
        }
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.api_port))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CronError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| CronError::Config(format!("failed to parse {}: {}", path.display(), e)))
}
