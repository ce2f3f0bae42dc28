use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, Result};

/// Top-level configuration (`capsule.toml`). Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub evidence: Option<EvidenceConfig>,
    #[serde(default)]
    pub artifacts: Option<ArtifactsConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

/// Retry policy for tool steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 30_000 }

/// Thresholds of the adaptive concurrency window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Grow when the rolling average step duration is below this.
    #[serde(default = "default_grow_below")]
    pub grow_below_ms: u64,
    /// Shrink when the rolling average step duration is above this.
    #[serde(default = "default_shrink_above")]
    pub shrink_above_ms: u64,
    /// Number of recent completions the rolling average covers.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            grow_below_ms: default_grow_below(),
            shrink_above_ms: default_shrink_above(),
            sample_size: default_sample_size(),
        }
    }
}

fn default_grow_below() -> u64 { 1000 }
fn default_shrink_above() -> u64 { 1500 }
fn default_sample_size() -> usize { 8 }

/// Evidence index backing the `retrieve_evidence` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// JSON array of evidence records.
    pub index_path: String,
    /// Collection used when a record does not name one.
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String { "external".to_string() }

/// Where finished runs are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

fn default_artifacts_dir() -> String { "./artifacts".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary, 2 = per step, 3 = per attempt and window changes.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CapsuleError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CapsuleError::Config(e.to_string()))
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }

    pub fn artifacts_dir(&self) -> Option<PathBuf> {
        self.artifacts.as_ref().map(|a| expand_home(&a.dir))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CAPSULE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CAPSULE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CAPSULE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CAPSULE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CAPSULE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.engine.retry.initial_backoff_ms, 100);
        assert_eq!(config.engine.window.grow_below_ms, 1000);
        assert_eq!(config.engine.window.shrink_above_ms, 1500);
        assert!(config.evidence.is_none());
        assert!(config.log_dir().is_none());
        assert!(config.artifacts_dir().is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[engine.retry]
max_attempts = 5

[log]
level = 3
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.initial_backoff_ms, 100);
        let log = config.log.as_ref().unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 3);
        assert_eq!(config.log_dir(), Some(PathBuf::from("./logs")));
    }

    #[test]
    fn test_disabled_log_has_no_dir() {
        let config: AppConfig = toml::from_str("[log]\nenabled = false\n").unwrap();
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/capsule.toml")).unwrap_err();
        assert!(matches!(err, CapsuleError::ConfigNotFound(_)));
        assert!(AppConfig::load_or_default(Path::new("/nonexistent/capsule.toml")).is_ok());
    }
}
