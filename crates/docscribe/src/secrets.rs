//! Secret resolution for API keys and credentials.
//!
//! A secret may be given in the config file in one of three ways, checked in
//! this order:
//!
//! 1. `value`: inline, for local testing
//! 2. `file`: path to a file holding the secret (Docker secrets)
//! 3. `env`: name of an environment variable

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: value, file or env)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Where a secret comes from. Empty strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl SecretSource {
    pub fn env(name: &str) -> Self {
        Self {
            env: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        [&self.value, &self.file, &self.env]
            .iter()
            .any(|s| s.as_deref().is_some_and(|s| !s.is_empty()))
    }

    pub fn resolve(&self) -> Result<SecretString, SecretError> {
        resolve_secret(
            self.value.as_deref(),
            self.file.as_deref(),
            self.env.as_deref(),
        )
    }

    /// Like [`SecretSource::resolve`], but an unconfigured source is `None`.
    pub fn resolve_optional(&self) -> Result<Option<SecretString>, SecretError> {
        match self.resolve() {
            Ok(secret) => Ok(Some(secret)),
            Err(SecretError::NoSourceProvided) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// Resolves a secret from the first configured source. File contents and
/// environment values are trimmed.
pub fn resolve_secret(
    value: Option<&str>,
    file: Option<&str>,
    env: Option<&str>,
) -> Result<SecretString, SecretError> {
    if let Some(value) = non_empty(value) {
        return Ok(SecretString::from(value));
    }

    if let Some(path) = non_empty(file) {
        let expanded = expand_home(path);
        return std::fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim()))
            .map_err(|e| SecretError::FileRead {
                path: expanded,
                source: e,
            });
    }

    if let Some(name) = non_empty(env) {
        return match std::env::var(name) {
            Ok(value) => Ok(SecretString::from(value.trim())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Expands a leading `~` to the home directory. `~user` is not supported.
pub(crate) fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    #[test]
    fn test_no_source() {
        let err = SecretSource::default().resolve().unwrap_err();
        assert!(matches!(err, SecretError::NoSourceProvided));
        assert!(SecretSource::default().resolve_optional().unwrap().is_none());
    }

    #[test]
    fn test_value_wins_and_empty_is_ignored() {
        let source = SecretSource {
            value: Some("inline".to_string()),
            env: Some("DOCSCRIBE_TEST_UNUSED".to_string()),
            ..SecretSource::default()
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "inline");

        let empty = SecretSource {
            value: Some(String::new()),
            ..SecretSource::default()
        };
        assert!(!empty.is_configured());
    }

    #[test]
    fn test_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "sk-123\n").unwrap();

        let source = SecretSource {
            file: Some(path.display().to_string()),
            ..SecretSource::default()
        };
        assert_eq!(source.resolve().unwrap().expose_secret(), "sk-123");
    }

    #[test]
    fn test_missing_file() {
        let err = resolve_secret(None, Some("/nonexistent/secret"), None).unwrap_err();
        assert!(matches!(err, SecretError::FileRead { .. }));
    }

    #[test]
    #[serial]
    fn test_env_source() {
        std::env::set_var("DOCSCRIBE_TEST_SECRET", " from-env ");
        let source = SecretSource::env("DOCSCRIBE_TEST_SECRET");
        assert_eq!(source.resolve().unwrap().expose_secret(), "from-env");
        std::env::remove_var("DOCSCRIBE_TEST_SECRET");

        let err = source.resolve().unwrap_err();
        assert!(matches!(err, SecretError::EnvVarNotSet { .. }));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), "/abs/path");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/keys/a"),
                format!("{}/keys/a", home.to_string_lossy())
            );
        }
    }
}
