use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "BURNIN_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL the scripts on managed machines post their webhooks to,
    /// e.g. `http://172.16.0.10:8000`.
    pub backend_url: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_script_dir")]
    pub script_dir: String,

    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub ssh_connect_timeout_secs: u64,

    /// Upper bound for a single remote command, including the memtester build.
    #[serde(default = "default_ssh_command_timeout_secs")]
    pub ssh_command_timeout_secs: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// 32-byte hex key. When set, SSH passwords are sealed in the inventory file.
    #[serde(default)]
    pub credential_key: Option<String>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    listen_addr: Option<String>,
    backend_url: Option<String>,
    data_dir: Option<String>,
    log_dir: Option<String>,
    script_dir: Option<String>,
    download_dir: Option<String>,
    ssh_connect_timeout_secs: Option<u64>,
    ssh_command_timeout_secs: Option<u64>,
    ping_timeout_ms: Option<u64>,
    credential_key: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_script_dir() -> String {
    "scripts".to_string()
}

fn default_download_dir() -> String {
    "data/downloads".to_string()
}

fn default_ssh_connect_timeout_secs() -> u64 {
    10
}

fn default_ssh_command_timeout_secs() -> u64 {
    900
}

fn default_ping_timeout_ms() -> u64 {
    1000
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let env_config: PartialServerConfig = envy::prefixed(ENV_PREFIX).from_env()?;
        Self::layered(config_path, env_config)
    }

    fn layered(config_path: Option<&str>, env_config: PartialServerConfig) -> Result<Self, ConfigError> {
        // 1. Load from file (optional)
        let file_config: PartialServerConfig = match config_path.map(Path::new) {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => PartialServerConfig::default(),
        };

        // 2. Merge: environment overrides file
        let backend_url = env_config
            .backend_url
            .or(file_config.backend_url)
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("BURNIN_BACKEND_URL"))?;

        Ok(ServerConfig {
            listen_addr: env_config
                .listen_addr
                .or(file_config.listen_addr)
                .unwrap_or_else(default_listen_addr),
            backend_url,
            data_dir: env_config
                .data_dir
                .or(file_config.data_dir)
                .unwrap_or_else(default_data_dir),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or_else(default_log_dir),
            script_dir: env_config
                .script_dir
                .or(file_config.script_dir)
                .unwrap_or_else(default_script_dir),
            download_dir: env_config
                .download_dir
                .or(file_config.download_dir)
                .unwrap_or_else(default_download_dir),
            ssh_connect_timeout_secs: env_config
                .ssh_connect_timeout_secs
                .or(file_config.ssh_connect_timeout_secs)
                .unwrap_or_else(default_ssh_connect_timeout_secs),
            ssh_command_timeout_secs: env_config
                .ssh_command_timeout_secs
                .or(file_config.ssh_command_timeout_secs)
                .unwrap_or_else(default_ssh_command_timeout_secs),
            ping_timeout_ms: env_config
                .ping_timeout_ms
                .or(file_config.ping_timeout_ms)
                .unwrap_or_else(default_ping_timeout_ms),
            credential_key: env_config
                .credential_key
                .or(file_config.credential_key)
                .filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn webhook_url(&self) -> String {
        format!("{}/report/webhook", self.backend_url)
    }

    pub fn inventory_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("servers_db.json")
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(&path, contents).unwrap();
        let path = path.to_string_lossy().into_owned();
        (dir, path)
    }

    #[test]
    fn file_values_fill_defaults() {
        let (_dir, path) = write_config(
            r#"
            backend_url = "http://172.16.0.10:8000/"
            script_dir = "/opt/burnin/scripts"
            ping_timeout_ms = 500
            "#,
        );

        let config = ServerConfig::layered(Some(&path), PartialServerConfig::default()).unwrap();
        assert_eq!(config.backend_url, "http://172.16.0.10:8000");
        assert_eq!(config.webhook_url(), "http://172.16.0.10:8000/report/webhook");
        assert_eq!(config.script_dir, "/opt/burnin/scripts");
        assert_eq!(config.ping_timeout(), Duration::from_millis(500));
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert_eq!(config.inventory_path(), Path::new("data").join("servers_db.json"));
        assert!(config.credential_key.is_none());
        assert_eq!(config.ssh_command_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn environment_overrides_file() {
        let (_dir, path) = write_config(
            r#"
            backend_url = "http://file:8000"
            listen_addr = "0.0.0.0:9000"
            "#,
        );
        let env = PartialServerConfig {
            backend_url: Some("http://env:8000".to_string()),
            ..Default::default()
        };

        let config = ServerConfig::layered(Some(&path), env).unwrap();
        assert_eq!(config.backend_url, "http://env:8000");
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
    }

    #[test]
    fn backend_url_is_required() {
        let err = ServerConfig::layered(None, PartialServerConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn broken_toml_is_reported() {
        let (_dir, path) = write_config("backend_url = ");
        let err = ServerConfig::layered(Some(&path), PartialServerConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
