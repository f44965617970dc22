//! # Event Bus Configuration
//!
//! Startup configuration for the context event bus: pool sizing, context
//! assignment policy, request timeouts and logging. Configuration is read
//! once at startup and immutable afterwards.
//!
//! ## Sources, lowest precedence first
//!
//! - Built-in defaults ([`defaults`])
//! - `config/eventbus.toml` or an explicit path
//! - `config/environments/<env>.toml`
//! - `EVENTBUS_*` environment variables (`EVENTBUS_POOL_SIZE=8`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bus_config::{BusConfig, AssignmentPolicy};
//!
//! let config = BusConfig::load(None, Some("production")).unwrap();
//! assert!(config.pool_size > 0);
//! if config.assignment_policy == AssignmentPolicy::LeastLoaded {
//!     println!("balancing deployments by load");
//! }
//! ```

pub mod settings;
pub mod defaults;

pub use settings::{load_config, AssignmentPolicy, BusConfig};
