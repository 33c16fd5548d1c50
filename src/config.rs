//! Configuration loader and validator for the wedding-planner sync client.
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_URL: &str = "http://localhost:5000";

/// `API_URL` resolved once per process, falling back to a local backend.
static API_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("API_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
});

pub fn api_url() -> &'static str {
    API_URL.as_str()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub api: Api,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Namespace of the local store (the signed-in user).
    pub user: String,
    pub read_timeout_ms: u64,
}

/// Backend settings. Everything is optional; the environment fills the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    #[serde(default)]
    pub base_url: Option<String>,
}

impl App {
    /// Data directory with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Backend base URL: `api.base_url` if set, else the process-wide `API_URL`.
    pub fn api_base_url(&self) -> String {
        self.api
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| api_url())
            .to_string()
    }

    /// Default SQLite location inside the data directory.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}/vivaha.db", self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.user.trim().is_empty() {
        return Err(ConfigError::Invalid("app.user must be non-empty"));
    }
    if cfg.app.read_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.read_timeout_ms must be > 0"));
    }
    if let Some(url) = cfg.api.base_url.as_deref() {
        if !url.trim().is_empty() && reqwest::Url::parse(url.trim()).is_err() {
            return Err(ConfigError::Invalid("api.base_url must be an absolute URL"));
        }
    }
    Ok(())
}

/// Example configuration file content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  user: "ana@example.com"
  read_timeout_ms: 5000

api:
  base_url: "http://localhost:5000"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.read_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.api_base_url(), "http://localhost:5000");
    }

    #[test]
    fn api_section_is_optional() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: ./data\n  user: bob\n  read_timeout_ms: 100\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.api.base_url.is_none());
        assert_eq!(cfg.api_base_url(), api_url());
    }

    #[test]
    fn invalid_user() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.user = "  ".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.user")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_timeout_and_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.read_timeout_ms = 0;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("read_timeout_ms")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.base_url = Some("not a url".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.database_url().ends_with("/data/vivaha.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.user, "ana@example.com");
    }
}
