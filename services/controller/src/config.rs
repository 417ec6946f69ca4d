//! Configuration for the work controller.

use std::path::PathBuf;

use anyhow::Result;

/// Work controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for the job store and the reconciliation lock file.
    pub data_dir: PathBuf,

    /// Path to the job database. Defaults to `jobs.db` under the data dir.
    pub db_path: PathBuf,

    /// Seconds between periodic reconciliation requests.
    pub reconcile_interval_secs: u64,

    /// Upper bound in seconds for a single reconciliation pass.
    pub pass_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir: PathBuf = std::env::var("JOBSYNC_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/jobsync".to_string())
            .into();

        let db_path = std::env::var("JOBSYNC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("jobs.db"));

        let reconcile_interval_secs = std::env::var("JOBSYNC_RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let pass_timeout_secs = std::env::var("JOBSYNC_PASS_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let log_level = std::env::var("JOBSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            data_dir,
            db_path,
            reconcile_interval_secs,
            pass_timeout_secs,
            log_level,
        })
    }
}
