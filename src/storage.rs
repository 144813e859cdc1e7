use crate::error::StorageError;
use crate::replication::{Record, Snapshot};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable home of the local replica, one entry per collection.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Snapshot, StorageError>;
    async fn save_collection(&self, name: &str, records: &[Record]) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            collections: Arc::new(RwLock::new(snapshot)),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        Ok(self.collections.read().await.clone())
    }

    async fn save_collection(&self, name: &str, records: &[Record]) -> Result<(), StorageError> {
        self.collections
            .write()
            .await
            .insert(name.to_string(), records.to_vec());
        Ok(())
    }
}

/// sled-backed store: key = collection name, value = JSON array of records.
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    const TREE: &'static str = "collections";

    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|source| StorageError::DatabaseOpen {
            name: path.to_string(),
            source,
        })?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree(Self::TREE)?;
        Ok(Self { tree })
    }
}

#[async_trait::async_trait]
impl SnapshotStore for SledStore {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        let mut snapshot = Snapshot::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let name = String::from_utf8_lossy(&key).to_string();
            let records: Vec<Record> = serde_json::from_slice(&value)?;
            snapshot.insert(name, records);
        }
        Ok(snapshot)
    }

    async fn save_collection(&self, name: &str, records: &[Record]) -> Result<(), StorageError> {
        let value = serde_json::to_vec(records)?;
        self.tree.insert(name.as_bytes(), value)?;
        self.tree.flush_async().await?;
        Ok(())
    }
}
