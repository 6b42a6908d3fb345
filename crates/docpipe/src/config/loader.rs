use std::path::{Path, PathBuf};

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads `path` if it exists; a missing file means "all defaults".
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    load_config(path)
}

/// Returns the canonical config path: `~/.docpipe/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".docpipe").join("config.json"))
}

/// Resolves the database location, falling back to the home directory.
pub fn resolve_database_path(config: &Config) -> Result<PathBuf, ConfigError> {
    match &config.database_path {
        Some(path) => Ok(path.clone()),
        None => crate::db::default_database_path().ok_or(ConfigError::NoHomeDirectory),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let worker = &config.worker;
    for (name, value) in [
        ("worker.poll_interval_ms", worker.poll_interval_ms),
        ("worker.reconnect_interval_ms", worker.reconnect_interval_ms),
        ("worker.liveness_timeout_secs", worker.liveness_timeout_secs),
        ("worker.sweep_interval_secs", worker.sweep_interval_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be greater than zero", name),
            });
        }
    }
    if worker.slots == 0 {
        return Err(ConfigError::Validation {
            message: "worker.slots must be at least 1".to_string(),
        });
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be at least 1".to_string(),
        });
    }

    let chunking = &config.chunking;
    if chunking.max_tokens == 0 {
        return Err(ConfigError::Validation {
            message: "chunking.max_tokens must be greater than zero".to_string(),
        });
    }
    if chunking.overlap_tokens >= chunking.max_tokens {
        return Err(ConfigError::Validation {
            message: format!(
                "chunking.overlap_tokens ({}) must be smaller than chunking.max_tokens ({})",
                chunking.overlap_tokens, chunking.max_tokens
            ),
        });
    }
    if let Err(reason) = crate::chunking::counter_by_name(&chunking.token_counter) {
        return Err(ConfigError::Validation { message: reason });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::AuditSinkKind;
    use std::time::Duration;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.worker.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.worker.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.worker.slots, 1);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.overlap_tokens, 100);
        assert_eq!(config.extraction.min_text_length, 20);
        assert_eq!(config.audit.sink, AuditSinkKind::Database);
    }

    #[test]
    fn test_partial_sections() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/var/lib/docpipe/jobs.db",
            "worker": { "slots": 4, "liveness_timeout_secs": 120 },
            "chunking": { "max_tokens": 200, "overlap_tokens": 20 },
            "audit": { "sink": "log" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.worker.slots, 4);
        assert_eq!(config.worker.liveness_timeout(), Duration::from_secs(120));
        assert_eq!(config.worker.poll_interval_ms, 2000);
        assert_eq!(config.chunking.options().max_tokens, 200);
        assert_eq!(config.audit.sink, AuditSinkKind::Log);
        assert_eq!(
            resolve_database_path(&config).unwrap(),
            PathBuf::from("/var/lib/docpipe/jobs.db")
        );
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_overlap_must_be_below_budget() {
        let result =
            load_config_from_str(r#"{ "chunking": { "max_tokens": 100, "overlap_tokens": 100 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(load_config_from_str(r#"{ "worker": { "slots": 0 } }"#).is_err());
        assert!(load_config_from_str(r#"{ "worker": { "poll_interval_ms": 0 } }"#).is_err());
        assert!(load_config_from_str(r#"{ "retry": { "max_attempts": 0 } }"#).is_err());
    }

    #[test]
    fn test_unknown_token_counter() {
        let result = load_config_from_str(r#"{ "chunking": { "token_counter": "words" } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_json() {
        let result = load_config_from_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "retry": { "max_attempts": 5 } }"#).unwrap();
        let config = load_config_or_default(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
    }
}
