//! Configuration loading, validation, and env substitution.
//!
//! Config files: `bambooclaw.toml`, `bambooclaw.yaml`, or `bambooclaw.json`
//! in `./`, then `config.{toml,yaml,yml,json}` in `~/.bambooclaw/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{ConfigError, Result},
    loader::{
        ConfigFormat, clear_config_dir, clear_data_dir, config_dir, data_dir, discover_and_load,
        ensure_data_dir, find_config_file, find_or_default_config_path, load_config,
        set_config_dir, set_data_dir,
    },
    schema::{
        BambooConfig, ChannelConfig, ChannelKind, CronConfig, CronJobEntry, DispatchConfig,
        GatewayConfig, ProviderConfig, ProviderKind, ReplyMode, SecurityConfig, SupervisorConfig,
        WorkspaceConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_str, validate_toml_str},
};
