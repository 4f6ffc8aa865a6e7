//! File configuration of the session daemon.
//!
//! ```toml
//! [connection]
//! host = "a1b2c3.iot.eu-central-1.amazonaws.com"
//! client_id = "node-17"
//! server_cert = "/etc/mqtt-session/ca.pem"
//! client_cert = "/etc/mqtt-session/client.pem"
//! client_key = "/etc/mqtt-session/client.key"
//! use_alpn = true            # port defaults to 443 then
//!
//! [session]
//! max_subscriptions = 10
//! report_deleted_messages = false
//!
//! [[topics]]
//! topic = "devices/node-17/cmd"
//! qos = 1
//! ```

use crate::mqtt::config::{ConnectionParams, SessionSettings, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_TLS_PORT};
use crate::mqtt::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_DIR: &str = "mqtt-session";
pub const CONFIG_FILE: &str = "session.toml";
const ALPN_PORT: u16 = 443;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub session: SessionSettings,
    pub topics: Vec<TopicConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    /// Falls back to 8883, or 443 with ALPN
    pub port: Option<u16>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub server_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    pub use_alpn: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            client_id: "mqtt-session".to_string(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            server_cert: None,
            client_cert: None,
            client_key: None,
            username: None,
            password: None,
            clean_session: true,
            use_alpn: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

async fn read_pem(path: &Option<PathBuf>) -> Result<Option<Vec<u8>>, ConfigError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| ConfigError::io(path, e))?;
    debug!("Loaded {} ({} bytes)", path.display(), pem.len());
    Ok(Some(pem))
}

impl AppConfig {
    /// `~/.config/mqtt-session/session.toml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| get_home_dir().join(".config"));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load `path`, or the defaults when the file does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::io(path, e))?;
        if !exists {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::io(path, e))?;
        let config = Self::parse(&content)?;
        info!(
            "Loaded configuration from {} ({} topics)",
            path.display(),
            config.topics.len()
        );
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigError::io(parent, e))?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConfigError::io(path, e))?;
        debug!("Configuration written to {}", path.display());
        Ok(())
    }
}

impl ConnectionConfig {
    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.use_alpn => ALPN_PORT,
            None => DEFAULT_TLS_PORT,
        }
    }

    /// Build the session's connection parameters, reading the PEM files
    pub async fn to_params(&self) -> Result<ConnectionParams, ConfigError> {
        let mut params = ConnectionParams::new(self.host.clone(), self.client_id.clone());
        params.port = self.port();
        params.keep_alive_secs = self.keep_alive_secs;
        params.server_cert = read_pem(&self.server_cert).await?;
        params.client_cert = read_pem(&self.client_cert).await?;
        params.client_key = read_pem(&self.client_key).await?;
        params.username = self.username.clone();
        params.password = self.password.clone();
        params.clean_session = self.clean_session;
        params.use_alpn = self.use_alpn;
        Ok(params)
    }
}
