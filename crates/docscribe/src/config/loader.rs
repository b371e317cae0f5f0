use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::proofread::ProofreadProvider;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Environment variable naming the config file when none is given.
pub const CONFIG_ENV_VAR: &str = "DOCSCRIBE_CONFIG";

/// Picks the config file: the explicit path, then `DOCSCRIBE_CONFIG`, then
/// `~/.docscribe/config.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docscribe")
        .join("config.json")
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field: field.to_string(),
            reason: format!("'{}' is not an http(s) URL", url),
        })
    }
}

fn validate_retry(field: &str, policy: &crate::retry::RetryPolicy) -> Result<(), ConfigError> {
    policy.validate().map_err(|reason| ConfigError::Validation {
        message: format!("{}: {}", field, reason),
    })
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let inference = &config.inference;
    validate_url("inference.submit_url", &inference.submit_url)?;
    validate_url("inference.result_url", &inference.result_url)?;
    validate_retry("inference.slot_poll", &inference.slot_poll)?;
    validate_retry("inference.submit_retry", &inference.submit_retry)?;
    validate_retry("inference.poll_retry", &inference.poll_retry)?;

    let lease = &config.lease;
    if lease.enabled {
        for (field, value) in [
            ("lease.start_url", &lease.start_url),
            ("lease.stop_url", &lease.stop_url),
        ] {
            match value {
                Some(url) => validate_url(field, url)?,
                None => {
                    return Err(ConfigError::Validation {
                        message: format!("{} is required when the lease is enabled", field),
                    })
                }
            }
        }
        if lease.resource_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Validation {
                message: "lease.resource_id is required when the lease is enabled".to_string(),
            });
        }
        if !lease.credentials.is_configured() {
            return Err(ConfigError::Validation {
                message: "lease.credentials is required when the lease is enabled".to_string(),
            });
        }
    }
    validate_retry("lease.start_retry", &lease.start_retry)?;
    validate_retry("lease.stop_retry", &lease.stop_retry)?;

    let proofreading = &config.proofreading;
    if proofreading.chunk_word_limit == 0 {
        return Err(ConfigError::Validation {
            message: "proofreading.chunk_word_limit must be at least 1".to_string(),
        });
    }
    match (&proofreading.provider, &proofreading.base_url) {
        (ProofreadProvider::Openai, None) => {
            return Err(ConfigError::Validation {
                message: "proofreading.base_url is required for the openai provider".to_string(),
            })
        }
        (_, Some(url)) => validate_url("proofreading.base_url", url)?,
        _ => {}
    }
    validate_retry("proofreading.chunk_retry", &proofreading.chunk_retry)?;

    Ok(())
}
