//! Defaults and constants
//!
//! Values used when neither a configuration file nor the environment
//! overrides a setting.

/// Context pool defaults
pub mod pool {
    /// Contexts per available core
    pub const CONTEXTS_PER_CORE: usize = 2;

    /// Used when the core count cannot be determined
    pub const FALLBACK_POOL_SIZE: usize = 4;

    /// Name prefix; contexts are named `<prefix>-<n>`
    pub const CONTEXT_NAME_PREFIX: &str = "bus-context";

    /// Twice the available parallelism
    pub fn pool_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get() * CONTEXTS_PER_CORE)
            .unwrap_or(FALLBACK_POOL_SIZE)
    }
}

/// Event bus defaults
pub mod bus {
    /// Request timeout when a send carries none (milliseconds)
    pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

    /// Instances per deployment when the caller does not say
    pub const DEFAULT_INSTANCES: usize = 1;
}

/// Configuration loading
pub mod loading {
    /// Base configuration file
    pub const CONFIG_FILE: &str = "config/eventbus.toml";

    /// Directory of `<environment>.toml` override files
    pub const ENVIRONMENTS_DIR: &str = "config/environments";

    /// Prefix of overriding environment variables, e.g. `EVENTBUS_POOL_SIZE`
    pub const ENV_PREFIX: &str = "EVENTBUS";

    pub const LOG_LEVEL: &str = "info";
}
