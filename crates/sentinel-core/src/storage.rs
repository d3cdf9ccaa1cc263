//! Storage gateway: the narrow interface over peer and file tables.
//!
//! Consumers (the network façade and the filesystem dispatcher) never see
//! SQL or any backend detail. The in-memory implementation here backs
//! tests and the default daemon; a database-backed implementation plugs
//! in behind the same trait.
//!
//! Batch operations are transactional: either every inner operation
//! applies or none does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Peer liveness as recorded in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Recently seen and usable
    Active,
    /// Known but quiet
    Stale,
    /// Gone; kept for history
    Disconnected,
}

/// A peer row.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Peer identifier
    pub id: String,
    /// Last known address
    pub address: String,
    /// Last known port
    pub port: u16,
    /// Liveness
    pub status: PeerStatus,
    /// Last time any traffic or announcement was seen
    pub last_seen: SystemTime,
    /// Last measured round-trip time in milliseconds (-1 = unmeasured)
    pub latency_ms: i64,
    /// NAT type hint from discovery or relay
    pub nat_hint: String,
}

impl PeerRecord {
    /// A freshly seen active peer.
    #[must_use]
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            status: PeerStatus::Active,
            last_seen: SystemTime::now(),
            latency_ms: -1,
            nat_hint: String::new(),
        }
    }
}

/// A file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path
    pub path: PathBuf,
    /// Hex SHA-256 of the contents
    pub hash: String,
    /// Size in bytes
    pub size: u64,
    /// Wall-clock modification timestamp (unix seconds)
    pub modified: i64,
    /// Whether at least one peer accepted the latest update
    pub synced: bool,
}

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Row missing
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend refused the operation
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// One operation inside a transactional batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Upsert a file row
    AddFile {
        /// Absolute path
        path: PathBuf,
        /// Content hash
        hash: String,
        /// Modification timestamp
        modified: i64,
        /// Size in bytes
        size: u64,
    },
    /// Flip a file's synced flag
    MarkSynced {
        /// Absolute path
        path: PathBuf,
        /// New flag value
        synced: bool,
    },
    /// Delete a file row
    RemoveFile {
        /// Absolute path
        path: PathBuf,
    },
    /// Upsert a peer row
    AddPeer(PeerRecord),
    /// Delete a peer row
    RemovePeer {
        /// Peer identifier
        id: String,
    },
    /// Record a measured latency
    UpdateLatency {
        /// Peer identifier
        id: String,
        /// Round-trip time in milliseconds
        latency_ms: i64,
    },
}

/// The narrow storage interface consumed by the façade and dispatcher.
pub trait StorageGateway: Send + Sync {
    /// Upsert a file row.
    ///
    /// An existing row with an unchanged hash and size keeps its synced
    /// flag (idempotent). A new row, or one whose hash changed, starts
    /// unsynced. Returns `true` on success.
    fn add_file(&self, path: &Path, hash: &str, modified: i64, size: u64)
    -> Result<bool, StorageError>;

    /// Set the synced flag for a file.
    fn mark_synced(&self, path: &Path, synced: bool) -> Result<(), StorageError>;

    /// Delete a file row; `Ok(false)` when it did not exist.
    fn remove_file(&self, path: &Path) -> Result<bool, StorageError>;

    /// One file row by path.
    fn file(&self, path: &Path) -> Result<Option<FileRecord>, StorageError>;

    /// Every file row under `root`.
    fn files_in(&self, root: &Path) -> Result<Vec<FileRecord>, StorageError>;

    /// User-configured ignore patterns.
    fn ignore_patterns(&self) -> Result<Vec<String>, StorageError>;

    /// Upsert a peer row.
    fn add_peer(&self, peer: PeerRecord) -> Result<(), StorageError>;

    /// Delete a peer row.
    fn remove_peer(&self, id: &str) -> Result<(), StorageError>;

    /// Every peer row.
    fn all_peers(&self) -> Result<Vec<PeerRecord>, StorageError>;

    /// One peer row.
    fn peer(&self, id: &str) -> Result<Option<PeerRecord>, StorageError>;

    /// Record a measured latency for a peer.
    fn update_latency(&self, id: &str, latency_ms: i64) -> Result<(), StorageError>;

    /// Flip a peer's status.
    fn update_peer_status(&self, id: &str, status: PeerStatus) -> Result<(), StorageError>;

    /// Apply `ops` atomically: any failure rolls the whole batch back.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError>;
}

#[derive(Default, Clone)]
struct Tables {
    files: HashMap<PathBuf, FileRecord>,
    peers: HashMap<String, PeerRecord>,
    ignore_patterns: Vec<String>,
}

impl Tables {
    fn apply(&mut self, op: &BatchOp) -> Result<(), StorageError> {
        match op {
            BatchOp::AddFile {
                path,
                hash,
                modified,
                size,
            } => {
                upsert_file(&mut self.files, path, hash, *modified, *size);
                Ok(())
            }
            BatchOp::MarkSynced { path, synced } => match self.files.get_mut(path) {
                Some(record) => {
                    record.synced = *synced;
                    Ok(())
                }
                None => Err(StorageError::NotFound(path.display().to_string())),
            },
            BatchOp::RemoveFile { path } => {
                self.files.remove(path);
                Ok(())
            }
            BatchOp::AddPeer(peer) => {
                self.peers.insert(peer.id.clone(), peer.clone());
                Ok(())
            }
            BatchOp::RemovePeer { id } => {
                self.peers.remove(id);
                Ok(())
            }
            BatchOp::UpdateLatency { id, latency_ms } => match self.peers.get_mut(id) {
                Some(peer) => {
                    peer.latency_ms = *latency_ms;
                    peer.last_seen = SystemTime::now();
                    Ok(())
                }
                None => Err(StorageError::NotFound(id.clone())),
            },
        }
    }
}

fn upsert_file(
    files: &mut HashMap<PathBuf, FileRecord>,
    path: &Path,
    hash: &str,
    modified: i64,
    size: u64,
) {
    match files.get_mut(path) {
        Some(existing) => {
            let unchanged = existing.hash == hash && existing.size == size;
            existing.modified = modified;
            if !unchanged {
                existing.hash = hash.to_string();
                existing.size = size;
                existing.synced = false;
            }
        }
        None => {
            files.insert(
                path.to_path_buf(),
                FileRecord {
                    path: path.to_path_buf(),
                    hash: hash.to_string(),
                    size,
                    modified,
                    synced: false,
                },
            );
        }
    }
}

/// In-memory storage gateway.
#[derive(Default)]
pub struct MemoryStore {
    tables: std::sync::Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the user-configured ignore patterns.
    pub fn set_ignore_patterns(&self, patterns: Vec<String>) {
        self.tables.lock().unwrap().ignore_patterns = patterns;
    }
}

impl StorageGateway for MemoryStore {
    fn add_file(
        &self,
        path: &Path,
        hash: &str,
        modified: i64,
        size: u64,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.lock().unwrap();
        upsert_file(&mut tables.files, path, hash, modified, size);
        Ok(true)
    }

    fn mark_synced(&self, path: &Path, synced: bool) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap();
        match tables.files.get_mut(path) {
            Some(record) => {
                record.synced = synced;
                Ok(())
            }
            None => Err(StorageError::NotFound(path.display().to_string())),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(self.tables.lock().unwrap().files.remove(path).is_some())
    }

    fn file(&self, path: &Path) -> Result<Option<FileRecord>, StorageError> {
        Ok(self.tables.lock().unwrap().files.get(path).cloned())
    }

    fn files_in(&self, root: &Path) -> Result<Vec<FileRecord>, StorageError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|record| record.path.starts_with(root))
            .cloned()
            .collect())
    }

    fn ignore_patterns(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.tables.lock().unwrap().ignore_patterns.clone())
    }

    fn add_peer(&self, peer: PeerRecord) -> Result<(), StorageError> {
        self.tables.lock().unwrap().peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    fn remove_peer(&self, id: &str) -> Result<(), StorageError> {
        self.tables.lock().unwrap().peers.remove(id);
        Ok(())
    }

    fn all_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        Ok(self.tables.lock().unwrap().peers.values().cloned().collect())
    }

    fn peer(&self, id: &str) -> Result<Option<PeerRecord>, StorageError> {
        Ok(self.tables.lock().unwrap().peers.get(id).cloned())
    }

    fn update_latency(&self, id: &str, latency_ms: i64) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap();
        match tables.peers.get_mut(id) {
            Some(peer) => {
                peer.latency_ms = latency_ms;
                peer.last_seen = SystemTime::now();
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn update_peer_status(&self, id: &str, status: PeerStatus) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap();
        match tables.peers.get_mut(id) {
            Some(peer) => {
                peer.status = status;
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap();
        // Stage on a copy; commit only when every op applied.
        let mut staged = tables.clone();
        for op in &ops {
            staged.apply(op)?;
        }
        *tables = staged;
        Ok(())
    }
}
