use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchyard_core::CacheTtls;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_agent")]
    pub default_agent: String,
    #[serde(default = "default_threshold")]
    pub classifier_threshold: f64,
    /// Optional TOML rule file; builtin rules are used when unset
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

fn default_agent() -> String {
    "general".to_string()
}

fn default_threshold() -> f64 {
    0.8
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent(),
            classifier_threshold: default_threshold(),
            rules_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_pattern_ttl")]
    pub pattern_ttl_secs: u64,
    #[serde(default = "default_classifier_ttl")]
    pub classifier_ttl_secs: u64,
}

fn default_capacity() -> usize {
    1024
}

fn default_pattern_ttl() -> u64 {
    3600
}

fn default_classifier_ttl() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            pattern_ttl_secs: default_pattern_ttl(),
            classifier_ttl_secs: default_classifier_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttls(&self) -> CacheTtls {
        CacheTtls {
            pattern: Duration::from_secs(self.pattern_ttl_secs),
            classifier: Duration::from_secs(self.classifier_ttl_secs),
            fallback_classifier: Duration::from_secs(self.classifier_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_task_timeout")]
    pub default_timeout_secs: u64,
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_task_timeout() -> u64 {
    300
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            default_timeout_secs: default_task_timeout(),
        }
    }
}

/// Platform config directory for switchyard.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
}

impl SwitchyardConfig {
    /// Load from an explicit path, or from the default location, falling
    /// back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_dir().join("config.toml"),
        };
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.routing.default_agent, "general");
        assert_eq!(config.routing.classifier_threshold, 0.8);
        assert_eq!(config.cache.capacity, 1024);
        assert_eq!(config.dispatch.backoff_ms, 200);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: SwitchyardConfig = toml::from_str(
            r#"
            [routing]
            classifier_threshold = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.routing.classifier_threshold, 0.6);
        assert_eq!(config.routing.default_agent, "general");
        assert_eq!(config.cache.pattern_ttl_secs, 3600);
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [dispatch]
            backoff_ms = 50
            "#,
        )
        .unwrap();
        let config = SwitchyardConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dispatch.backoff_ms, 50);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SwitchyardConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.routing.default_agent, "general");
    }

    #[test]
    fn test_malformed_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not [ valid toml").unwrap();
        assert!(SwitchyardConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_ttls_conversion() {
        let ttls = CacheConfig::default().ttls();
        assert_eq!(ttls.pattern, Duration::from_secs(3600));
        assert_eq!(ttls.classifier, Duration::from_secs(60));
    }
}
