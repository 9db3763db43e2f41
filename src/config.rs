use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::net::wire::Compression;
use crate::partition::Host;

pub const DEFAULT_PORT: u16 = 461; // "FANOUT" in ascii, summed

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Knobs of the speculative solver, shared by every partition solve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct SolverConfig {
    /// Replicas raced straight away.
    #[builder(default = 1)]
    pub initial_concurrency: usize,
    /// Upper bound on replicas in flight at once.
    #[builder(default = 3)]
    pub max_concurrency: usize,
    /// How long to wait for a success before launching another replica.
    #[builder(default = 100)]
    pub escalate_after_ms: u64,
    /// Total time a partition solve may take.
    #[builder(default = 3000)]
    pub deadline_ms: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SolverConfig {
    pub fn escalate_after(&self) -> Duration {
        Duration::from_millis(self.escalate_after_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "solver.initial_concurrency must be at least 1".into(),
            ));
        }
        if self.initial_concurrency > self.max_concurrency {
            return Err(ConfigError::Invalid(format!(
                "solver.initial_concurrency ({}) exceeds solver.max_concurrency ({})",
                self.initial_concurrency, self.max_concurrency
            )));
        }
        if self.deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "solver.deadline_ms must be positive".into(),
            ));
        }
        if self.escalate_after_ms == 0 {
            return Err(ConfigError::Invalid(
                "solver.escalate_after_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct DirectorConfig {
    /// This process' identity in the fleet.
    #[builder(default = Host::new("localhost", DEFAULT_PORT))]
    pub local_host: Host,
    /// Global budget of one `ask_and_merge` call.
    #[builder(default = 10_000)]
    pub request_deadline_ms: u64,
    #[builder(default = 5_000)]
    pub heartbeat_interval_ms: u64,
    /// Lock stripes guarding read/unread tracking.
    #[builder(default = 1024)]
    pub stripe_count: usize,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DirectorConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct TransportConfig {
    /// Compress frame bodies with zstd.
    #[builder(default = false)]
    pub compression: bool,
    #[builder(default = 3)]
    pub compression_level: i32,
    /// Budget for a single replica call, connect included.
    #[builder(default = 2_000)]
    pub call_timeout_ms: u64,
    #[builder(default = 64 * 1024 * 1024)]
    pub max_frame_bytes: usize,
    /// Name presented in, and verified against, replica certificates.
    #[builder(default = "localhost".to_owned())]
    pub server_name: String,
    /// Calls a host serves at once before answering 503.
    #[builder(default = 256)]
    pub max_concurrent_requests: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TransportConfig {
    pub fn compression(&self) -> Compression {
        if self.compression {
            Compression::Zstd(self.compression_level)
        } else {
            Compression::None
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub solver: SolverConfig,
    pub director: DirectorConfig,
    pub transport: TransportConfig,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.solver.validate()?;
        if self.director.stripe_count == 0 {
            return Err(ConfigError::Invalid(
                "director.stripe_count must be positive".into(),
            ));
        }
        if self.director.request_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "director.request_deadline_ms must be positive".into(),
            ));
        }
        if self.director.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "director.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.transport.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "transport.max_concurrent_requests must be positive".into(),
            ));
        }
        Ok(())
    }
}
