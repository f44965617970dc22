//! Bus Configuration Module
//!
//! Loads [`BusConfig`] from TOML files with environment-specific overrides
//! and `EVENTBUS_*` environment variables.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How deployments are spread over the context pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    /// The k-th assignment gets context `k mod N`
    #[default]
    RoundRobin,
    /// Fewest live assignments, lowest index on ties
    LeastLoaded,
}

/// Event bus startup configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Number of pooled contexts (worker threads)
    pub pool_size: usize,

    /// Reply timeout for requests that do not set one
    pub default_request_timeout_ms: u64,

    pub assignment_policy: AssignmentPolicy,

    /// Instances per deployment when options do not say
    pub default_instances: usize,

    /// Contexts are named `<prefix>-<n>`
    pub context_name_prefix: String,

    /// Node identity within a cluster; generated when empty.
    /// `$VAR` references are expanded.
    pub node_id: String,

    /// Default tracing filter for binaries
    pub log_level: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pool_size: defaults::pool::pool_size(),
            default_request_timeout_ms: defaults::bus::REQUEST_TIMEOUT_MS,
            assignment_policy: AssignmentPolicy::default(),
            default_instances: defaults::bus::DEFAULT_INSTANCES,
            context_name_prefix: defaults::pool::CONTEXT_NAME_PREFIX.to_string(),
            node_id: String::new(),
            log_level: defaults::loading::LOG_LEVEL.to_string(),
        }
    }
}

impl BusConfig {
    /// Load configuration from files with environment overrides.
    ///
    /// An explicit `base_path` must exist; the default file is optional.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&BusConfig::default()).context("Failed to seed default configuration")?,
        );

        builder = match base_path {
            Some(path) => {
                debug!("Loading bus config: {:?}", path);
                builder.add_source(File::from(path).required(true))
            }
            None => builder.add_source(File::from(Path::new(defaults::loading::CONFIG_FILE)).required(false)),
        };

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_dir = base_path
                .and_then(Path::parent)
                .map(|dir| dir.join("environments"))
                .unwrap_or_else(|| PathBuf::from(defaults::loading::ENVIRONMENTS_DIR));
            let env_file = env_dir.join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (EVENTBUS_ prefix)
        builder = builder.add_source(
            Environment::with_prefix(defaults::loading::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut config: BusConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BusConfig = toml::from_str(content).context("Invalid bus configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in string values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let expanded = shellexpand::env(&self.node_id).context("Failed to expand node_id")?;
        self.node_id = expanded.into_owned();
        Ok(())
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    /// Validate configuration for correctness
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.default_request_timeout_ms == 0 {
            bail!("default_request_timeout_ms must be positive");
        }
        if self.default_instances == 0 {
            bail!("default_instances must be at least 1");
        }
        if self.context_name_prefix.trim().is_empty() {
            bail!("context_name_prefix cannot be empty");
        }
        Ok(())
    }
}

/// Convenience function to load configuration from the default locations
pub fn load_config(environment: Option<&str>) -> Result<BusConfig> {
    BusConfig::load(None, environment)
}
