// Library surface of the mesh sync engine.
//
// The daemon (main.rs) is a thin wrapper around SyncSession; tests and
// embedders drive the same API through SyncHandle.

pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod replication;
pub mod shutdown;
pub mod storage;

pub use config::Config;
pub use error::{AppError, StorageError, SyncError, TransportError};
pub use identity::{compute_id, PeerIdentity, Role};
pub use network::connection_state::SyncStatus;
pub use network::message::SyncMessage;
pub use network::session::{
    ChangeOrigin, DatasetChange, SessionInfo, SessionSettings, SyncHandle, SyncSession,
};
pub use network::transport::{MemoryNetwork, TcpTransport, Transport};
pub use replication::{merge_collection, Dataset, Record, Snapshot};
pub use storage::{MemoryStore, SledStore, SnapshotStore};
