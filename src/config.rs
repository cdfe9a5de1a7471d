use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the app host
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings applied to every app
    #[serde(default)]
    pub defaults: AppDefaults,

    /// Root directory for repos, instances, app data and temp files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// App brought up first at boot (the default landing app)
    pub default_app: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the reverse proxy listens on (default: 8080)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port the REST API listens on (default: 8081)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
        }
    }
}

/// Timeouts governing deploys and proxied requests
#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// Seconds to wait for a newly started instance to answer HTTP
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Seconds a freshly spawned process is watched for crash-on-start
    #[serde(default = "default_daemon_grace")]
    pub daemon_grace_secs: u64,

    /// Seconds between a stop request and forced kill
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Total seconds allowed for one proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl AppDefaults {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn daemon_grace(&self) -> Duration {
        Duration::from_secs(self.daemon_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            daemon_grace_secs: default_daemon_grace(),
            shutdown_grace_secs: default_shutdown_grace(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_api_port() -> u16 {
    8081
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./appdock-data")
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_daemon_grace() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            defaults: AppDefaults::default(),
            data_dir: default_data_dir(),
            default_app: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.server.api_port, 8081);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.defaults.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.defaults.shutdown_grace(), Duration::from_secs(5));
        assert!(config.default_app.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/appdock"
            default_app = "home"

            [server]
            proxy_port = 80

            [defaults]
            startup_timeout_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/appdock"));
        assert_eq!(config.default_app.as_deref(), Some("home"));
        assert_eq!(config.server.proxy_port, 80);
        assert_eq!(config.server.api_port, 8081);
        assert_eq!(config.defaults.startup_timeout_secs, 60);
        assert_eq!(config.defaults.daemon_grace_secs, 10);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load("/definitely/not/here.toml").unwrap();
        assert_eq!(config.server.proxy_port, 8080);
    }
}
