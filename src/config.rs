//! Configuration management for the mesh sync daemon.
//!
//! TOML on disk. On first run, if no config exists, one is written with
//! defaults (spoke role, platform data directory).

use crate::error::{AppError, SyncError};
use crate::identity::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Get the platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\meshsync
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshsync")
    } else {
        // Linux/Mac: ~/.meshsync
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshsync")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    /// Which mesh to join. Trimmed and lower-cased before use.
    pub namespace: String,
    /// Stable id of the local user/device, part of spoke identifiers.
    pub local_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Accept channels here (required for the hub, optional for spokes).
    #[serde(default)]
    pub listen_address: Option<String>,
    /// Endpoint identifier -> host:port, e.g. `"hub-acme" = "10.0.0.5:7420"`.
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub heartbeat_interval_ms: u64,
    /// Coalesce rendezvous flapping before reporting disconnected.
    pub disconnect_debounce_ms: u64,
    pub collision_cooldown_ms: u64,
    pub transport_cooldown_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Consecutive unanswered PINGs before eviction. 0 disables.
    pub max_missed_pongs: u32,
    pub auth_timeout_ms: u64,
    pub roster_collection: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 25_000,
            disconnect_debounce_ms: 3_000,
            collision_cooldown_ms: 10_000,
            transport_cooldown_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            max_missed_pongs: 3,
            auth_timeout_ms: 15_000,
            roster_collection: "users".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn disconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.disconnect_debounce_ms)
    }

    pub fn collision_cooldown(&self) -> Duration {
        Duration::from_millis(self.collision_cooldown_ms)
    }

    pub fn transport_cooldown(&self) -> Duration {
        Duration::from_millis(self.transport_cooldown_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(SyncError::Config(
                "sync.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(SyncError::Config(
                "sync.backoff_base_ms must be > 0 and <= sync.backoff_cap_ms".to_string(),
            ));
        }
        if self.roster_collection.trim().is_empty() {
            return Err(SyncError::Config(
                "sync.roster_collection must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Empty means the platform data directory.
    #[serde(default)]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            data_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/meshsyncd.log".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                role: Role::Spoke,
                namespace: "default".to_string(),
                local_id: "local".to_string(),
            },
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_create(path: &str) -> Result<Self, AppError> {
        if fs::metadata(path).is_ok() {
            let mut config = Self::load_from_file(path)?;
            if config.storage.data_dir.is_empty() {
                config.storage.data_dir = get_data_dir().to_string_lossy().to_string();
            }
            Ok(config)
        } else {
            let mut config = Config::default();
            config.storage.data_dir = get_data_dir().to_string_lossy().to_string();
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = PathBuf::from(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.node.namespace.trim().is_empty() {
            return Err(AppError::Config("node.namespace must not be empty".to_string()));
        }
        if self.node.local_id.trim().is_empty() {
            return Err(AppError::Config("node.local_id must not be empty".to_string()));
        }
        if self.node.role == Role::Hub && self.network.listen_address.is_none() {
            return Err(AppError::Config(
                "network.listen_address is required for the hub role".to_string(),
            ));
        }
        self.sync.validate()?;
        Ok(())
    }

    /// Namespace-specific database path.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join(format!(
            "{}.db",
            crate::identity::normalize_namespace(&self.node.namespace)
        ))
    }
}
