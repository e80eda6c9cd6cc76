//! Configuration loading, validation and env substitution.
//!
//! Config files: `chatrelay.toml`, `chatrelay.yaml` or `chatrelay.json`,
//! searched in `./` then the user config directory (`~/.config/chatrelay/`).
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, config_dir, data_dir, default_database_url, discover_and_load,
        find_config_file, load_config, resolve_database_url,
    },
    schema::*,
    validate::{Diagnostic, Severity, ValidationResult},
};
