//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/quizduel/config.toml)
//! 3. Environment variables (QUIZDUEL_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duel::EngineConfig;
use crate::net::RetryPolicy;

/// Environment variable prefix
const ENV_PREFIX: &str = "QUIZDUEL";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket endpoint of the duel server
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// REST base URL for duel metadata lookups (optional)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Directory for local data (credentials, logs)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Credential file override
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Seconds to wait for a connection attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Failed attempts before the session gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Log file used when QUIZDUEL_LOG is set
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_url: None,
            data_dir: default_data_dir(),
            credentials_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.server_url = val;
            }
        }

        // Empty string clears the API URL
        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            self.api_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_CONNECT_TIMEOUT", ENV_PREFIX)) {
            match val.parse() {
                Ok(secs) => self.connect_timeout_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid {}_CONNECT_TIMEOUT={}", ENV_PREFIX, val),
            }
        }

        if let Ok(val) = std::env::var(format!("{}_MAX_RETRIES", ENV_PREFIX)) {
            match val.parse() {
                Ok(retries) => self.max_retries = retries,
                Err(_) => tracing::warn!("Ignoring invalid {}_MAX_RETRIES={}", ENV_PREFIX, val),
            }
        }
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with QUIZDUEL_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quizduel")
            .join("config.toml")
    }

    /// Get the path to the credential file
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("credentials.json"))
    }

    /// Timing policy for the duel engine
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            server_url: self.server_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn default_server_url() -> String {
    "ws://localhost:3000/duels".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quizduel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "QUIZDUEL_SERVER_URL",
        "QUIZDUEL_API_URL",
        "QUIZDUEL_DATA_DIR",
        "QUIZDUEL_CONNECT_TIMEOUT",
        "QUIZDUEL_MAX_RETRIES",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.max_retries, 3);
        assert!(config.api_url.is_none());
        assert!(config.data_dir.ends_with("quizduel"));
    }

    #[test]
    fn test_credentials_path() {
        let mut config = Config::default();
        assert!(config.credentials_path().ends_with("credentials.json"));

        config.credentials_file = Some(PathBuf::from("/secrets/creds.json"));
        assert_eq!(
            config.credentials_path(),
            PathBuf::from("/secrets/creds.json")
        );
    }

    #[test]
    fn test_engine_config_timing() {
        let config = Config {
            connect_timeout_secs: 5,
            max_retries: 2,
            ..Config::default()
        };

        let engine = config.engine_config();
        assert_eq!(engine.connect_timeout, Duration::from_secs(5));
        assert_eq!(engine.retry.max_retries, 2);
        assert_eq!(engine.server_url, config.server_url);
    }

    #[test]
    fn test_env_override_server_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("QUIZDUEL_SERVER_URL", "wss://duels.example.com/socket");
        config.apply_env_overrides();

        assert_eq!(config.server_url, "wss://duels.example.com/socket");
    }

    #[test]
    fn test_env_override_api_url() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("QUIZDUEL_API_URL", "https://api.example.com");
        config.apply_env_overrides();
        assert_eq!(config.api_url.as_deref(), Some("https://api.example.com"));

        // Empty string clears it
        env::set_var("QUIZDUEL_API_URL", "");
        config.apply_env_overrides();
        assert!(config.api_url.is_none());
    }

    #[test]
    fn test_env_override_invalid_number_is_ignored() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("QUIZDUEL_MAX_RETRIES", "lots");
        env::set_var("QUIZDUEL_CONNECT_TIMEOUT", "30");
        config.apply_env_overrides();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            server_url = "ws://example.com/duels"
            data_dir = "/custom/data"
            max_retries = 5
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.server_url, "ws://example.com/duels");
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.connect_timeout_secs, 15);
    }

    #[test]
    fn test_save_and_reload() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config {
            api_url: Some("https://api.example.com".to_string()),
            max_retries: 4,
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.api_url, config.api_url);
        assert_eq!(loaded.max_retries, 4);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.max_retries, 3);
        assert!(config.api_url.is_none());
    }
}
