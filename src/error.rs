use thiserror::Error;

/// Failures reported by a transport endpoint or channel.
///
/// The session manager classifies these into restart cooldowns: an identity
/// collision waits long enough for the stale binding to expire at the
/// rendezvous, everything else retries on the short cooldown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("identifier {0} is already bound")]
    IdentityCollision(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("no route to {0}")]
    UnknownRoute(String),
}

impl TransportError {
    pub fn is_identity_collision(&self) -> bool {
        matches!(self, TransportError::IdentityCollision(_))
    }
}

/// Errors surfaced by the sync engine API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("identity collision: {id} is already bound")]
    IdentityCollision { id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send to {remote_id} failed: channel closed")]
    ConnectionSend { remote_id: String },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("session is shut down")]
    SessionClosed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::IdentityCollision(id) => SyncError::IdentityCollision { id },
            other => SyncError::Transport(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error for the daemon binary.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}
