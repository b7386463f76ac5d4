//! Configuration loading, environment overrides and validation.
//!
//! Config files: `switchboard.toml`, `switchboard.yaml` or `switchboard.json`,
//! searched in `./` then `~/.config/switchboard/`. `${ENV_VAR}` placeholders
//! are expanded before parsing and `SWITCHBOARD_*` variables override the
//! parsed values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, apply_env_overrides_with, config_dir, discover_and_load,
        load_config, load_or_discover, to_toml,
    },
    schema::{
        BreakerConfig, IdempotencyConfig, LockConfig, MetricsConfig, QueueConfig,
        RateLimitConfig, StoreConfig, SwitchboardConfig, WorkerConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
