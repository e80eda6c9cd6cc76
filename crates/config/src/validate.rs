//! Configuration validation.
//!
//! Flags unknown or misspelled keys in TOML files and checks that the
//! dispatch settings can actually work together.

use std::{collections::HashMap, path::Path};

use crate::schema::{DelayRange, RelayConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// "syntax", "unknown-field", "type-error", "range" or "timing"
    pub category: &'static str,
    /// Dotted path, e.g. "dispatch.workers"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn error(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(category, path, message)
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Struct};

    let range = || Struct(HashMap::from([("min_ms", Leaf), ("max_ms", Leaf)]));

    Struct(HashMap::from([
        (
            "gateway",
            Struct(HashMap::from([
                ("base_url", Leaf),
                ("api_key", Leaf),
                ("timeout_secs", Leaf),
            ])),
        ),
        (
            "database",
            Struct(HashMap::from([("url", Leaf), ("max_connections", Leaf)])),
        ),
        (
            "dispatch",
            Struct(HashMap::from([
                ("workers", Leaf),
                ("max_concurrent_per_account", Leaf),
                ("admission_poll_ms", Leaf),
                ("admission_max_polls", Leaf),
                ("lock_ttl_secs", Leaf),
                ("contention_delay_ms", Leaf),
                ("lease_secs", Leaf),
                ("idle_poll_ms", Leaf),
                ("shutdown_grace_secs", Leaf),
            ])),
        ),
        (
            "retry",
            Struct(HashMap::from([
                ("max_attempts", Leaf),
                ("backoff_base_ms", Leaf),
            ])),
        ),
        (
            "retention",
            Struct(HashMap::from([
                ("completed_max_age_secs", Leaf),
                ("completed_max_count", Leaf),
                ("failed_max_age_secs", Leaf),
                ("sweep_interval_secs", Leaf),
            ])),
        ),
        (
            "pacing",
            Struct(HashMap::from([
                ("seen_pause", range()),
                ("short_max_chars", Leaf),
                ("short_typing", range()),
                ("medium_max_chars", Leaf),
                ("medium_typing", range()),
                ("long_typing", range()),
            ])),
        ),
        ("metrics", Struct(HashMap::from([("enabled", Leaf)]))),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Closest candidate within `max_distance` edits.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|&c| (c, levenshtein(needle, c)))
        .filter(|&(_, d)| d > 0 && d <= max_distance)
        .min_by_key(|&(_, d)| d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or the discovered one if `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "syntax",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");
    let mut result = if is_toml {
        match std::fs::read_to_string(actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::error(
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        // YAML/JSON: no key walk, but the parsed values are still checked.
        match crate::loader::load_config(actual_path) {
            Ok(config) => ValidationResult {
                diagnostics: validate_config(&config),
                config_path: None,
            },
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::error("type-error", "", e.to_string())],
                config_path: None,
            },
        }
    };
    result.config_path = Some(actual_path.clone());
    result
}

/// Validate a TOML string without touching the filesystem.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::error(
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<RelayConfig>(toml_str) {
        Ok(config) => diagnostics.extend(validate_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::error(
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Semantic checks on a parsed config.
#[must_use]
pub fn validate_config(config: &RelayConfig) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let dispatch = &config.dispatch;

    if dispatch.workers == 0 {
        diagnostics.push(Diagnostic::error(
            "range",
            "dispatch.workers",
            "at least one worker is required",
        ));
    }
    if dispatch.max_concurrent_per_account == 0 {
        diagnostics.push(Diagnostic::error(
            "range",
            "dispatch.max_concurrent_per_account",
            "a ceiling of 0 would never admit a job",
        ));
    }
    if dispatch.admission_poll_ms == 0 || dispatch.admission_max_polls == 0 {
        diagnostics.push(Diagnostic::warning(
            "range",
            "dispatch.admission_poll_ms",
            "admission window is empty; saturated accounts fail immediately",
        ));
    }
    if config.retry.max_attempts == 0 {
        diagnostics.push(Diagnostic::warning(
            "range",
            "retry.max_attempts",
            "treated as 1 (a single attempt without retries)",
        ));
    }
    if url::Url::parse(&config.gateway.base_url).is_err() {
        diagnostics.push(Diagnostic::error(
            "range",
            "gateway.base_url",
            format!("not a valid URL: {}", config.gateway.base_url),
        ));
    }

    let pacing = &config.pacing;
    for (path, range) in [
        ("pacing.seen_pause", pacing.seen_pause),
        ("pacing.short_typing", pacing.short_typing),
        ("pacing.medium_typing", pacing.medium_typing),
        ("pacing.long_typing", pacing.long_typing),
    ] {
        check_range(path, range, &mut diagnostics);
    }
    if pacing.short_max_chars > pacing.medium_max_chars {
        diagnostics.push(Diagnostic::error(
            "range",
            "pacing.short_max_chars",
            "must not exceed pacing.medium_max_chars",
        ));
    }

    // The lock is refreshed before every gateway call, so it has to outlive
    // one call plus the pause in front of it.
    let refresh_gap_ms = pacing.longest_pause_ms() + config.gateway.timeout_secs * 1_000;
    if dispatch.lock_ttl_secs * 1_000 <= refresh_gap_ms {
        diagnostics.push(Diagnostic::warning(
            "timing",
            "dispatch.lock_ttl_secs",
            format!(
                "lock ttl {}s does not outlive one gateway call plus the longest pause ({}ms)",
                dispatch.lock_ttl_secs, refresh_gap_ms
            ),
        ));
    }
    if dispatch.lease_secs <= dispatch.lock_ttl_secs {
        diagnostics.push(Diagnostic::warning(
            "timing",
            "dispatch.lease_secs",
            "job lease shorter than the lock ttl; slow jobs may be recovered while still running",
        ));
    }

    diagnostics
}

fn check_range(path: &str, range: DelayRange, diagnostics: &mut Vec<Diagnostic>) {
    if range.min_ms > range.max_ms {
        diagnostics.push(Diagnostic::error(
            "range",
            path,
            format!("min_ms {} is greater than max_ms {}", range.min_ms, range.max_ms),
        ));
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (toml::Value::Table(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let known_keys: Vec<&str> = fields.keys().copied().collect();
    for (key, child_value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if let Some(child_schema) = fields.get(key.as_str()) {
            check_unknown_fields(child_value, child_schema, &path, diagnostics);
            continue;
        }
        let message = match suggest(key, &known_keys, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        diagnostics.push(Diagnostic::error("unknown-field", path, message));
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(result: &'a [Diagnostic], path: &str) -> Option<&'a Diagnostic> {
        result.iter().find(|d| d.path == path)
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("workers", "workers"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("workrs", "workers"), 1);
        assert_eq!(levenshtein("retyr", "retry"), 2);
    }

    #[test]
    fn defaults_are_clean() {
        let result = validate_toml_str("");
        assert!(
            result.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            result.diagnostics
        );
    }

    #[test]
    fn misspelled_key_gets_a_suggestion() {
        let result = validate_toml_str("[dispatch]\nworkrs = 4\n");
        let d = find(&result.diagnostics, "dispatch.workrs").unwrap();
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.category, "unknown-field");
        assert!(d.message.contains("workers"), "{}", d.message);
    }

    #[test]
    fn unknown_top_level_section() {
        let result = validate_toml_str("[redis]\nhost = \"localhost\"\n");
        assert!(find(&result.diagnostics, "redis").is_some());
        assert!(result.has_errors());
    }

    #[test]
    fn syntax_error_stops_early() {
        let result = validate_toml_str("[dispatch\nworkers = 1");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn wrong_type_is_reported() {
        let result = validate_toml_str("[dispatch]\nworkers = \"ten\"\n");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[test]
    fn zero_workers_and_ceiling_are_errors() {
        let result = validate_toml_str(
            "[dispatch]\nworkers = 0\nmax_concurrent_per_account = 0\n",
        );
        assert!(find(&result.diagnostics, "dispatch.workers").is_some());
        assert!(find(&result.diagnostics, "dispatch.max_concurrent_per_account").is_some());
        assert_eq!(result.count(Severity::Error), 2);
    }

    #[test]
    fn inverted_range_is_an_error() {
        let result = validate_toml_str("[pacing.long_typing]\nmin_ms = 9000\nmax_ms = 1000\n");
        let d = find(&result.diagnostics, "pacing.long_typing").unwrap();
        assert_eq!(d.severity, Severity::Error);
    }

    #[test]
    fn short_lock_ttl_warns() {
        // 10s of typing plus a 15s gateway call does not fit in 20s.
        let result = validate_toml_str("[dispatch]\nlock_ttl_secs = 20\n");
        let d = find(&result.diagnostics, "dispatch.lock_ttl_secs").unwrap();
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.category, "timing");
        assert!(!result.has_errors());
    }

    #[test]
    fn slow_gateway_needs_a_longer_lock_ttl() {
        let result = validate_toml_str("[gateway]\ntimeout_secs = 25\n");
        let d = find(&result.diagnostics, "dispatch.lock_ttl_secs").unwrap();
        assert!(d.message.contains("35000ms"), "{}", d.message);

        let result =
            validate_toml_str("[gateway]\ntimeout_secs = 25\n[dispatch]\nlock_ttl_secs = 36\n");
        assert!(find(&result.diagnostics, "dispatch.lock_ttl_secs").is_none());
    }

    #[test]
    fn bad_gateway_url_is_an_error() {
        let result = validate_toml_str("[gateway]\nbase_url = \"not a url\"\n");
        assert!(find(&result.diagnostics, "gateway.base_url").is_some());
    }

    #[test]
    fn validates_yaml_files_semantically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatrelay.yaml");
        std::fs::write(&path, "dispatch:\n  workers: 0\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(find(&result.diagnostics, "dispatch.workers").is_some());
    }
}
