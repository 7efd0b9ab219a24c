use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use super::models::{Server, ServerRecord};
use super::writer::{snapshot_writer_task, SnapshotFile};
use crate::services::encryption_service::CredentialCipher;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Credential error: {0}")]
    Credential(String),
}

/// Server inventory keyed by `server_id`.
///
/// Reads and writes go to an in-memory map. When opened on a file, every
/// mutation schedules a background snapshot of the whole map.
#[derive(Clone, Debug)]
pub struct ServerStore {
    servers: Arc<DashMap<String, ServerRecord>>,
    snapshot: Option<(Arc<SnapshotFile>, mpsc::Sender<()>)>,
}

impl ServerStore {
    pub fn in_memory() -> Self {
        Self {
            servers: Arc::new(DashMap::new()),
            snapshot: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>, cipher: Option<CredentialCipher>) -> Result<Self, StoreError> {
        let file = Arc::new(SnapshotFile::new(path.into(), cipher));
        let servers = Arc::new(DashMap::new());
        for record in file.load()? {
            servers.insert(record.server.server_id.clone(), record);
        }
        info!(count = servers.len(), path = ?file.path(), "Loaded server inventory.");

        let (tx, rx) = mpsc::channel();
        let writer_file = file.clone();
        let writer_servers = servers.clone();
        thread::spawn(move || snapshot_writer_task(writer_file, writer_servers, rx));

        Ok(Self {
            servers,
            snapshot: Some((file, tx)),
        })
    }

    pub fn records(&self) -> Vec<ServerRecord> {
        let mut records: Vec<ServerRecord> = self.servers.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.server.server_id.cmp(&b.server.server_id));
        records
    }

    pub fn list(&self) -> Vec<Server> {
        self.records().into_iter().map(|r| r.server).collect()
    }

    pub fn get(&self, server_id: &str) -> Option<Server> {
        self.servers.get(server_id).map(|e| e.server.clone())
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Inserts or replaces a server. Returns `true` when the id was new.
    pub fn upsert(&self, server: Server) -> bool {
        let created = match self.servers.entry(server.server_id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.server = server;
                record.updated_at = Utc::now();
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(ServerRecord::new(server));
                true
            }
        };
        self.schedule_persist();
        created
    }

    /// Applies `f` to the current record under the entry lock, so concurrent
    /// updates to other fields are never overwritten with stale values.
    pub fn update<F>(&self, server_id: &str, f: F) -> Option<Server>
    where
        F: FnOnce(&mut Server),
    {
        let updated = {
            let mut record = self.servers.get_mut(server_id)?;
            f(&mut record.server);
            // The key is the id; a closure must not move the record.
            record.server.server_id = server_id.to_string();
            record.updated_at = Utc::now();
            record.server.clone()
        };
        self.schedule_persist();
        Some(updated)
    }

    pub fn delete(&self, server_id: &str) -> bool {
        let removed = self.servers.remove(server_id).is_some();
        if removed {
            self.schedule_persist();
        }
        removed
    }

    /// Writes the snapshot synchronously.
    pub fn flush(&self) -> Result<(), StoreError> {
        match &self.snapshot {
            Some((file, _)) => file.write(&self.servers),
            None => Ok(()),
        }
    }

    fn schedule_persist(&self) {
        if let Some((_, tx)) = &self.snapshot {
            if tx.send(()).is_err() {
                warn!("Server store writer thread is gone; change not persisted.");
            }
        }
    }
}
