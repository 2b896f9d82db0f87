//! Configuration module for overlay-router
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use overlay_router::config::{load_config, Role};
//!
//! let config = load_config("/etc/overlay-router/config.json").unwrap();
//! config.validate_for(Role::Relay).unwrap();
//! println!("Relay endpoint: {}", config.relay.public_endpoint());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str,
    load_config_with_env, ENV_LOG_LEVEL, ENV_PUBLIC_IP, ENV_REGISTRY_URL,
};
pub use types::{
    ClientConfig, Config, InterfaceConfig, LogConfig, RegistryConfig, RelayConfig, Role,
    SchedulerConfig, ServiceConfig, StaticRoute, StatsConfig,
};
