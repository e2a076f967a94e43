//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `GANTRY_DATABASE_URL`: PostgreSQL connection string (required)
//! - `GANTRY_MAX_CONCURRENT_PASSES`: Worker pool size for scheduling passes (default: num_cpus * 2)
//! - `GANTRY_SWEEP_INTERVAL_MS`: Safety-net sweep interval re-enqueueing active runs (default: 5000)
//! - `GANTRY_HEARTBEAT_INTERVAL_MS`: Minimum interval between resource-tracking heartbeats (default: 60000)
//! - `GANTRY_WAITING_FOR_CLUSTER_TIMEOUT_MIN`: Minutes before a cluster wait fails the run (default: 10)
//! - `GANTRY_BACKEND_RETRY_ATTEMPTS`: Attempt cap for transient backend calls (default: 3)
//! - `GANTRY_BACKEND_RETRY_BASE_DELAY_MS`: Base backoff delay for backend retries (default: 100)
//! - `GANTRY_DEFAULT_CLUSTER_ID`: Cluster used when a run does not name one (default: 0)

use std::{env, time::Duration};

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Maximum number of concurrently executing scheduling passes
    pub max_concurrent_passes: usize,

    /// Safety-net sweep interval in milliseconds
    pub sweep_interval_ms: u64,

    /// Minimum interval between per-task heartbeats in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Minutes a run may wait for an on-demand cluster before failing
    pub waiting_for_cluster_timeout_min: i64,

    /// Attempt cap for transient backend calls
    pub backend_retry_attempts: u32,

    /// Base backoff delay for backend retries in milliseconds
    pub backend_retry_base_delay_ms: u64,

    /// Cluster used when a run does not name one
    pub default_cluster_id: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("GANTRY_DATABASE_URL")
            .context("GANTRY_DATABASE_URL environment variable is required")?;

        let max_concurrent_passes = env::var("GANTRY_MAX_CONCURRENT_PASSES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| num_cpus::get().max(1) * 2);

        let sweep_interval_ms = env::var("GANTRY_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        let heartbeat_interval_ms = env::var("GANTRY_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60_000);

        let waiting_for_cluster_timeout_min = env::var("GANTRY_WAITING_FOR_CLUSTER_TIMEOUT_MIN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let backend_retry_attempts = env::var("GANTRY_BACKEND_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let backend_retry_base_delay_ms = env::var("GANTRY_BACKEND_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let default_cluster_id = env::var("GANTRY_DEFAULT_CLUSTER_ID")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            database_url,
            max_concurrent_passes,
            sweep_interval_ms,
            heartbeat_interval_ms,
            waiting_for_cluster_timeout_min,
            backend_retry_attempts,
            backend_retry_base_delay_ms,
            default_cluster_id,
        })
    }

    /// Retry policy applied to transient backend calls.
    pub fn backend_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.backend_retry_attempts,
            base_delay: Duration::from_millis(self.backend_retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    /// Heartbeat interval as a chrono duration for timestamp arithmetic.
    pub fn heartbeat_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_interval_ms as i64)
    }

    /// Cluster-wait timeout as a chrono duration.
    pub fn waiting_for_cluster_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.waiting_for_cluster_timeout_min)
    }

    /// Create a test configuration with short intervals.
    pub fn test_config() -> Self {
        Self {
            database_url: "postgres://unused".to_string(),
            max_concurrent_passes: 4,
            sweep_interval_ms: 50,
            heartbeat_interval_ms: 60_000,
            waiting_for_cluster_timeout_min: 10,
            backend_retry_attempts: 2,
            backend_retry_base_delay_ms: 1,
            default_cluster_id: 0,
        }
    }
}
