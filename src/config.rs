//! Engine configuration and per-query options.
//!
//! [`EngineConfig`] is loaded once (usually from a TOML file) and shared by
//! every query; [`QueryOptions`] travels with a single query.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`EngineConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the file, or `<inline>` for string input.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rule engine settings.
    pub optimizer: OptimizerConfig,
    /// Cost model constants.
    pub estimator: EstimatorConfig,
    /// Runtime settings.
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `[optimizer]` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum number of candidate plans kept alive during fan-out.
    pub max_plans: usize,
    /// Maximum number of full rule sweeps while searching for a fixed point.
    pub max_sweeps: usize,
    /// Rule names that never fire; `-all` disables every optional rule.
    pub disabled_rules: Vec<String>,
    /// Enables the cluster rules for sharded collections.
    pub cluster: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_plans: 128,
            max_sweeps: 3,
            disabled_rules: Vec::new(),
            cluster: false,
        }
    }
}

impl OptimizerConfig {
    /// True if `rule` is disabled by name or by `-all`.
    pub fn is_disabled(&self, rule: &str) -> bool {
        self.disabled_rules
            .iter()
            .any(|name| name == rule || name == "-all")
    }
}

/// `[estimator]` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Equality selectivity when an index has no distinct-value estimate.
    pub default_eq_selectivity: f64,
    /// Selectivity of a bounded range on an index field.
    pub range_selectivity: f64,
    /// Selectivity assumed for a Filter node that is not served by an index.
    pub filter_selectivity: f64,
    /// Cost multiplier for every row whose document must be fetched.
    pub fetch_penalty: f64,
    /// Assumed length of arrays iterated by EnumerateList.
    pub default_list_length: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_eq_selectivity: 0.01,
            range_selectivity: 0.3,
            filter_selectivity: 0.5,
            fetch_penalty: 2.0,
            default_list_length: 100.0,
        }
    }
}

/// `[execution]` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Rows requested per pull.
    pub batch_size: usize,
    /// Default deadline in milliseconds; zero disables it.
    pub max_runtime_ms: u64,
    /// Worker threads of the shard dispatch runtime.
    pub shard_workers: usize,
    /// Fault points armed when the engine starts, as `Component::operation`.
    pub faults: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_runtime_ms: 0,
            shard_workers: 4,
            faults: Vec::new(),
        }
    }
}

/// Options carried by a single query.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Overrides `execution.batch_size`.
    pub batch_size: Option<usize>,
    /// Maximum wall-clock runtime; the next pull after expiry fails.
    pub max_runtime: Option<Duration>,
    /// Set to `true` by another thread to cancel the query.
    pub cancel_token: Option<Arc<AtomicBool>>,
    /// Default failure policy for every Modify node.
    pub ignore_errors: bool,
    /// Runs the optimizer; when false the plan executes as given.
    pub optimize: bool,
    /// Collects per-block call statistics.
    pub profile: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_runtime: None,
            cancel_token: None,
            ignore_errors: false,
            optimize: true,
            profile: false,
        }
    }
}

impl QueryOptions {
    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    /// Sets the deadline.
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    /// Attaches a cancel token.
    pub fn with_cancel_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Sets the default failure policy of Modify nodes.
    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    /// Enables or disables the optimizer.
    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Enables per-block statistics.
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}
