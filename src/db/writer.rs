use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, error, info};

use super::models::ServerRecord;
use super::server_store::StoreError;
use crate::services::encryption_service::CredentialCipher;

/// Snapshot file plus the lock that serializes writers to it.
#[derive(Debug)]
pub(super) struct SnapshotFile {
    path: PathBuf,
    cipher: Option<CredentialCipher>,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    pub(super) fn new(path: PathBuf, cipher: Option<CredentialCipher>) -> Self {
        Self {
            path,
            cipher,
            write_lock: Mutex::new(()),
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn load(&self) -> Result<Vec<ServerRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read(&self.path)?;
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let mut records: Vec<ServerRecord> = serde_json::from_slice(&contents)?;
        if let Some(cipher) = &self.cipher {
            for record in &mut records {
                record.server.ssh_password = cipher
                    .open(&record.server.ssh_password)
                    .map_err(StoreError::Credential)?;
            }
        } else if records
            .iter()
            .any(|r| CredentialCipher::is_sealed(&r.server.ssh_password))
        {
            return Err(StoreError::Credential(
                "store contains sealed credentials but no credential key is configured".to_string(),
            ));
        }
        Ok(records)
    }

    pub(super) fn write(&self, servers: &DashMap<String, ServerRecord>) -> Result<(), StoreError> {
        // Held from collection through the rename.
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("snapshot lock poisoned")))?;

        let mut records: Vec<ServerRecord> = servers.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| a.server.server_id.cmp(&b.server.server_id));

        if let Some(cipher) = &self.cipher {
            for record in &mut records {
                record.server.ssh_password = cipher
                    .seal(&record.server.ssh_password)
                    .map_err(StoreError::Credential)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&records)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(count = records.len(), path = ?self.path, "Server snapshot written.");
        Ok(())
    }
}

/// Runs on a dedicated OS thread. Each signal means "the map changed";
/// signals that queued up while a write was in flight collapse into one write.
pub(super) fn snapshot_writer_task(
    file: Arc<SnapshotFile>,
    servers: Arc<DashMap<String, ServerRecord>>,
    rx: mpsc::Receiver<()>,
) {
    info!(path = ?file.path(), "Server store writer thread started.");

    while rx.recv().is_ok() {
        while rx.try_recv().is_ok() {}
        if let Err(e) = file.write(&servers) {
            error!(error = %e, "Failed to persist server snapshot.");
        }
    }

    info!("Server store channel closed. Shutting down writer thread.");
}
