//! Configuration management.
//!
//! Loaded from environment variables under the `NUVOM__` prefix (double
//! underscore nesting separator), mirroring `spec.md` §6's environment
//! contract.

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment.
    #[serde(default = "default_environment")]
    pub environment: Environment,

    /// Telemetry configuration (logging).
    #[serde(default)]
    pub telemetry: crate::telemetry::TelemetryConfig,

    /// Short name of the active queue backend (`memory`, `file`, ...).
    #[serde(default = "default_queue_backend")]
    pub queue_backend: String,

    /// Short name of the active result backend (`memory`, `file`, `sqlite`, ...).
    #[serde(default = "default_result_backend")]
    pub result_backend: String,

    /// Short name of the active serialization backend (treated as opaque
    /// outside the codec module).
    #[serde(default = "default_serialization_backend")]
    pub serialization_backend: String,

    /// Maximum queue size; 0 = unbounded.
    #[serde(default)]
    pub queue_maxsize: usize,

    /// Number of worker threads in the pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Number of jobs the dispatcher pulls per `pop_batch` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Default per-job timeout when a job doesn't specify one.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Default timeout classification policy.
    #[serde(default)]
    pub timeout_policy: crate::job::TimeoutPolicy,

    /// Default delay before a retry re-enqueue.
    #[serde(default)]
    pub retry_delay_secs: u64,

    /// Path to the SQLite result backend's database file.
    #[serde(default = "default_sqlite_db_path")]
    pub sqlite_db_path: String,

    /// Port a Prometheus exporter would bind (exporter itself is out of
    /// core scope per `spec.md` §1).
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,

    /// Directory backing the file queue / plugin declaration file location.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: String,

    /// Directory backing the file result backend.
    #[serde(default = "default_result_dir")]
    pub result_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            telemetry: crate::telemetry::TelemetryConfig::default(),
            queue_backend: default_queue_backend(),
            result_backend: default_result_backend(),
            serialization_backend: default_serialization_backend(),
            queue_maxsize: 0,
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            job_timeout_secs: default_job_timeout_secs(),
            timeout_policy: crate::job::TimeoutPolicy::default(),
            retry_delay_secs: 0,
            sqlite_db_path: default_sqlite_db_path(),
            prometheus_port: default_prometheus_port(),
            queue_dir: default_queue_dir(),
            result_dir: default_result_dir(),
        }
    }
}

/// Deployment environment, per `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
    Test,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
            Environment::Test => "test",
        };
        write!(f, "{s}")
    }
}

fn default_environment() -> Environment {
    Environment::Dev
}

fn default_queue_backend() -> String {
    "memory".to_string()
}

fn default_result_backend() -> String {
    "memory".to_string()
}

fn default_serialization_backend() -> String {
    "msgpack".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    16
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_sqlite_db_path() -> String {
    ".nuvom/nuvom.db".to_string()
}

fn default_prometheus_port() -> u16 {
    9469
}

fn default_queue_dir() -> String {
    "nuvom_queue".to_string()
}

fn default_result_dir() -> String {
    ".nuvom/results".to_string()
}

impl Config {
    /// Load configuration from environment variables (prefix `NUVOM`,
    /// separator `__`), falling back to field defaults.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("NUVOM").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overridden by environment variables.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NUVOM").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.queue_backend, "memory");
        assert_eq!(cfg.result_backend, "memory");
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.batch_size, 16);
    }
}
