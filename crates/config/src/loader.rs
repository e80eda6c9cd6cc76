use std::path::{Path, PathBuf};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::{env_subst::substitute_env, schema::RelayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "chatrelay.toml",
    "chatrelay.yaml",
    "chatrelay.yml",
    "chatrelay.json",
];

const APP_NAME: &str = "chatrelay";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./chatrelay.{toml,yaml,yml,json}`
/// 2. `~/.config/chatrelay/chatrelay.{toml,yaml,yml,json}`
///
/// Returns `RelayConfig::default()` if no config file is found or it fails
/// to parse.
pub fn discover_and_load() -> RelayConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    RelayConfig::default()
}

/// First existing config file in the standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// User-global config directory (`~/.config/chatrelay/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|d| d.config_dir().to_path_buf())
}

/// Data directory holding the default job database.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".chatrelay"))
}

/// `sqlite://<data_dir>/chatrelay.db`, created on first use.
pub fn default_database_url() -> String {
    format!("sqlite://{}", data_dir().join("chatrelay.db").display())
}

/// The configured database URL, or the default one.
pub fn resolve_database_url(config: &RelayConfig) -> String {
    config
        .database
        .url
        .clone()
        .unwrap_or_else(default_database_url)
}

/// Apply `CHATRELAY_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: RelayConfig) -> RelayConfig {
    apply_env_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides_with(
    mut config: RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> RelayConfig {
    if let Some(url) = lookup("CHATRELAY_GATEWAY_URL") {
        config.gateway.base_url = url;
    }
    if let Some(key) = lookup("CHATRELAY_GATEWAY_API_KEY") {
        config.gateway.api_key = Some(Secret::new(key));
    }
    if let Some(url) = lookup("CHATRELAY_DATABASE_URL") {
        config.database.url = Some(url);
    }
    if let Some(workers) = parse_var(&lookup, "CHATRELAY_WORKERS") {
        config.dispatch.workers = workers;
    }
    if let Some(ceiling) = parse_var(&lookup, "CHATRELAY_MAX_CONCURRENT_PER_ACCOUNT") {
        config.dispatch.max_concurrent_per_account = ceiling;
    }
    config
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        },
    }
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RelayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("chatrelay.toml");
        std::fs::write(&toml_path, "[dispatch]\nworkers = 3\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().dispatch.workers, 3);

        let yaml_path = dir.path().join("chatrelay.yaml");
        std::fs::write(&yaml_path, "retry:\n  max_attempts: 5\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().retry.max_attempts, 5);

        let json_path = dir.path().join("chatrelay.json");
        std::fs::write(&json_path, r#"{"gateway":{"timeout_secs":9}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().gateway.timeout_secs, 9);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.ini");
        std::fs::write(&path, "workers=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/chatrelay.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chatrelay.toml"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let lookup = |name: &str| match name {
            "CHATRELAY_GATEWAY_URL" => Some("http://waha:3000".to_string()),
            "CHATRELAY_GATEWAY_API_KEY" => Some("token".to_string()),
            "CHATRELAY_DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "CHATRELAY_WORKERS" => Some("4".to_string()),
            "CHATRELAY_MAX_CONCURRENT_PER_ACCOUNT" => Some("not-a-number".to_string()),
            _ => None,
        };
        let cfg = apply_env_overrides_with(RelayConfig::default(), lookup);
        assert_eq!(cfg.gateway.base_url, "http://waha:3000");
        assert_eq!(cfg.gateway.api_key.unwrap().expose_secret(), "token");
        assert_eq!(cfg.database.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(cfg.dispatch.workers, 4);
        // Unparsable values leave the default in place.
        assert_eq!(cfg.dispatch.max_concurrent_per_account, 2);
    }

    #[test]
    fn database_url_falls_back_to_data_dir() {
        let cfg = RelayConfig::default();
        let url = resolve_database_url(&cfg);
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("chatrelay.db"));
    }
}
