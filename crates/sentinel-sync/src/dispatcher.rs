//! Filesystem change dispatcher.
//!
//! Consumes a stream of change events, applies the ignore rules, computes
//! content metadata, persists it through the storage gateway and — when
//! sync is enabled — broadcasts the change to every known peer through
//! the network façade as a sync command:
//!
//! ```text
//! UPDATE_AVAILABLE|relative/path|hex_sha256|size
//! DELETE_FILE|relative/path
//! ```
//!
//! The database is updated even while sync is paused so local state stays
//! correct; only the broadcast is skipped. A file counts as synced once
//! at least one peer accepted the payload (or immediately, when there is
//! nobody to tell). Newly connected peers receive the full inventory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sentinel_core::{
    BusEvent, NetworkService, PeerStatus, StorageGateway, Subscription, topics,
};

use crate::hasher::hash_file;
use crate::ignore::IgnoreMatcher;

/// A canonical filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file or directory appeared
    Created(PathBuf),
    /// A file's contents (or a directory's entries) changed
    Modified(PathBuf),
    /// A file or directory went away
    Deleted(PathBuf),
    /// A rename observed as a pair
    Renamed {
        /// Old path
        from: PathBuf,
        /// New path
        to: PathBuf,
    },
}

/// Application-level sync commands exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// A file changed and is available from the sender
    UpdateAvailable {
        /// Path relative to the watch root
        path: String,
        /// Hex SHA-256 of the contents
        hash: String,
        /// Size in bytes
        size: u64,
    },
    /// A file was deleted at the sender
    DeleteFile {
        /// Path relative to the watch root
        path: String,
    },
}

impl SyncCommand {
    /// Wire encoding.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::UpdateAvailable { path, hash, size } => {
                format!("UPDATE_AVAILABLE|{path}|{hash}|{size}")
            }
            Self::DeleteFile { path } => format!("DELETE_FILE|{path}"),
        }
    }

    /// Parse a wire command.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('|');
        match parts.next()? {
            "UPDATE_AVAILABLE" => {
                let path = parts.next()?.to_string();
                let hash = parts.next()?.to_string();
                let size = parts.next()?.parse().ok()?;
                Some(Self::UpdateAvailable { path, hash, size })
            }
            "DELETE_FILE" => Some(Self::DeleteFile {
                path: parts.next()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Result of a tree scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    /// Regular files recorded
    pub scanned: usize,
    /// Entries skipped by ignore rules
    pub ignored: usize,
    /// Entries that failed (unreadable, vanished mid-scan)
    pub errors: usize,
}

/// The dispatcher.
pub struct FileSyncDispatcher {
    network: Arc<NetworkService>,
    storage: Arc<dyn StorageGateway>,
    root: PathBuf,
    sync_enabled: AtomicBool,
    matcher: std::sync::Mutex<IgnoreMatcher>,
}

impl FileSyncDispatcher {
    /// Create a dispatcher for `root`, loading user ignore patterns from
    /// storage.
    #[must_use]
    pub fn new(network: Arc<NetworkService>, root: PathBuf, sync_enabled: bool) -> Arc<Self> {
        let storage = network.storage();
        let user_patterns = storage.ignore_patterns().unwrap_or_default();
        Arc::new(Self {
            network,
            storage,
            root,
            sync_enabled: AtomicBool::new(sync_enabled),
            matcher: std::sync::Mutex::new(IgnoreMatcher::new(user_patterns)),
        })
    }

    /// Watch root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether broadcasts are currently on.
    #[must_use]
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    /// Pause or resume broadcasting. Database updates continue either
    /// way.
    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "sync broadcast toggled");
    }

    /// Re-read user ignore patterns from storage.
    pub fn reload_ignore_patterns(&self) {
        let patterns = self.storage.ignore_patterns().unwrap_or_default();
        self.matcher.lock().unwrap().set_user_patterns(patterns);
    }

    /// Classification for one path; pure for a fixed pattern set.
    #[must_use]
    pub fn should_ignore(&self, path: &Path) -> bool {
        self.matcher.lock().unwrap().should_ignore(&self.root, path)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn now_ts() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Walk the root, record every non-ignored regular file.
    ///
    /// Existing rows keep their synced flag unless contents changed; new
    /// rows start unsynced. Recursion never enters ignored directories.
    pub fn initial_scan(&self) -> ScanSummary {
        self.reload_ignore_patterns();
        let mut summary = ScanSummary::default();
        let root = self.root.clone();
        info!(root = %root.display(), "starting scan");
        self.scan_dir(&root, &mut summary);
        info!(
            scanned = summary.scanned,
            ignored = summary.ignored,
            errors = summary.errors,
            "scan complete"
        );
        summary
    }

    /// Re-scan one subtree (directory create/modify events).
    pub fn scan_subtree(&self, dir: &Path) -> ScanSummary {
        let mut summary = ScanSummary::default();
        self.scan_dir(dir, &mut summary);
        summary
    }

    fn scan_dir(&self, dir: &Path, summary: &mut ScanSummary) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "cannot read directory");
                summary.errors += 1;
                return;
            }
        };

        for entry in entries {
            let Ok(entry) = entry else {
                summary.errors += 1;
                continue;
            };
            let path = entry.path();

            if self.should_ignore(&path) {
                summary.ignored += 1;
                continue;
            }

            let Ok(file_type) = entry.file_type() else {
                summary.errors += 1;
                continue;
            };
            if file_type.is_dir() {
                self.scan_dir(&path, summary);
            } else if file_type.is_file() {
                match self.record_file(&path) {
                    Ok(()) => summary.scanned += 1,
                    Err(err) => {
                        debug!(path = %path.display(), %err, "skipping unreadable file");
                        summary.errors += 1;
                    }
                }
            }
        }
    }

    fn record_file(&self, path: &Path) -> std::io::Result<()> {
        let hash = hash_file(path)?;
        let size = std::fs::metadata(path)?.len();
        if self
            .storage
            .add_file(path, &hash, Self::now_ts(), size)
            .is_err()
        {
            warn!(path = %path.display(), "storage refused file row");
        }
        Ok(())
    }

    /// Consume change events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ChangeEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("change event stream closed");
    }

    /// Apply one change event end to end.
    pub async fn handle_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
                self.handle_upsert(&path).await;
            }
            ChangeEvent::Deleted(path) => {
                self.handle_delete(&path).await;
            }
            ChangeEvent::Renamed { from, to } => {
                self.handle_delete(&from).await;
                self.handle_upsert(&to).await;
            }
        }
    }

    async fn handle_upsert(&self, path: &Path) {
        if self.should_ignore(path) {
            debug!(path = %path.display(), "change ignored by pattern");
            return;
        }

        if path.is_dir() {
            // Directory events re-scan the subtree: editors and tools
            // often move whole trees into place.
            let summary = self.scan_subtree(path);
            debug!(
                path = %path.display(),
                scanned = summary.scanned,
                "directory change rescanned"
            );
            return;
        }

        let (hash, size) = match (hash_file(path), std::fs::metadata(path)) {
            (Ok(hash), Ok(meta)) => (hash, meta.len()),
            _ => {
                // Vanished between event and processing.
                if !path.exists() {
                    let _ = self.storage.remove_file(path);
                    debug!(path = %path.display(), "file gone before processing");
                } else {
                    warn!(path = %path.display(), "cannot compute metadata");
                    self.network
                        .metrics()
                        .sync_errors
                        .fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        };

        // Database always updates, paused or not.
        if self
            .storage
            .add_file(path, &hash, Self::now_ts(), size)
            .is_err()
        {
            self.network
                .metrics()
                .sync_errors
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.sync_enabled() {
            debug!(path = %path.display(), "sync paused, broadcast skipped");
            return;
        }

        self.broadcast_update(path, &hash, size).await;
    }

    async fn handle_delete(&self, path: &Path) {
        if self.should_ignore(path) {
            return;
        }

        match self.storage.remove_file(path) {
            Ok(true) => {}
            Ok(false) => return, // never tracked
            Err(_) => {
                self.network
                    .metrics()
                    .sync_errors
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if !self.sync_enabled() {
            return;
        }
        self.broadcast_delete(path).await;
    }

    /// Broadcast an update to every active peer; marks the file synced
    /// once at least one peer accepted it.
    pub async fn broadcast_update(&self, path: &Path, hash: &str, size: u64) {
        let peers = self.active_peers();
        if peers.is_empty() {
            // Nobody to notify: synced by definition.
            let _ = self.storage.mark_synced(path, true);
            return;
        }

        let command = SyncCommand::UpdateAvailable {
            path: self.relative(path),
            hash: hash.to_string(),
            size,
        }
        .encode();

        let (mut ok, mut failed) = (0usize, 0usize);
        for peer in &peers {
            match self.network.send(peer, command.as_bytes()).await {
                Ok(()) => ok += 1,
                Err(err) => {
                    failed += 1;
                    debug!(peer, %err, "update broadcast failed");
                }
            }
        }

        if ok > 0 {
            self.network
                .metrics()
                .files_synced
                .fetch_add(1, Ordering::Relaxed);
            let _ = self.storage.mark_synced(path, true);
        }
        if failed > 0 {
            self.network
                .metrics()
                .sync_errors
                .fetch_add(failed as u64, Ordering::Relaxed);
            warn!(path = %path.display(), failed, "update broadcast incomplete");
        }
    }

    /// Broadcast a delete to every active peer.
    pub async fn broadcast_delete(&self, path: &Path) {
        let peers = self.active_peers();
        if peers.is_empty() {
            return;
        }

        let command = SyncCommand::DeleteFile {
            path: self.relative(path),
        }
        .encode();

        let mut failed = 0usize;
        for peer in &peers {
            if let Err(err) = self.network.send(peer, command.as_bytes()).await {
                failed += 1;
                debug!(peer, %err, "delete broadcast failed");
            }
        }
        if failed > 0 {
            self.network
                .metrics()
                .sync_errors
                .fetch_add(failed as u64, Ordering::Relaxed);
        }
    }

    /// Send the whole known inventory to one peer (on-connect catch-up).
    pub async fn broadcast_all_to_peer(&self, peer: &str) {
        let files = match self.storage.files_in(&self.root) {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "cannot enumerate files for catch-up");
                return;
            }
        };

        let mut sent = 0usize;
        for file in files {
            if !file.path.exists() {
                continue;
            }
            let command = SyncCommand::UpdateAvailable {
                path: self.relative(&file.path),
                hash: file.hash.clone(),
                size: file.size,
            }
            .encode();
            if self.network.send(peer, command.as_bytes()).await.is_ok() {
                sent += 1;
            }
        }
        info!(peer, sent, "catch-up complete");
    }

    /// Wire the on-connect catch-up: every `PeerConnected` event triggers
    /// a full inventory send to that peer. Keep the returned guard alive.
    #[must_use]
    pub fn start_catchup(self: Arc<Self>) -> Subscription {
        let dispatcher = self.clone();
        self.network.bus().subscribe(
            topics::PEER_CONNECTED,
            Arc::new(move |event| {
                if let BusEvent::PeerConnected { peer_id, .. } = event {
                    let dispatcher = dispatcher.clone();
                    let peer = peer_id.clone();
                    tokio::spawn(async move {
                        dispatcher.broadcast_all_to_peer(&peer).await;
                    });
                }
            }),
        )
    }

    fn active_peers(&self) -> Vec<String> {
        self.storage
            .all_peers()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.status == PeerStatus::Active)
            .map(|p| p.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{
        DaemonConfig, EventBus, MemoryStore, Metrics, SessionManager,
        config::{DiscoverySection, TransportsEnabled},
    };
    use std::sync::Mutex;
    use std::time::Duration;

    fn make_network(peer_id: &str) -> Arc<NetworkService> {
        let session = Arc::new(SessionManager::with_kdf_iterations(peer_id, 1_000));
        let config = DaemonConfig {
            listen_port: 0,
            transports_enabled: TransportsEnabled {
                tcp: true,
                quic: false,
                webrtc: false,
                relay: false,
            },
            discovery: DiscoverySection {
                enable_udp: false,
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(NetworkService::new(
            config,
            session,
            Arc::new(MemoryStore::new()),
            EventBus::new(),
            Arc::new(Metrics::new()),
        ))
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if probe() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_sync_command_codec() {
        let update = SyncCommand::UpdateAvailable {
            path: "src/a.txt".into(),
            hash: "cafe".into(),
            size: 42,
        };
        assert_eq!(update.encode(), "UPDATE_AVAILABLE|src/a.txt|cafe|42");
        assert_eq!(SyncCommand::parse(&update.encode()).unwrap(), update);

        let delete = SyncCommand::DeleteFile {
            path: "src/b.txt".into(),
        };
        assert_eq!(delete.encode(), "DELETE_FILE|src/b.txt");
        assert_eq!(SyncCommand::parse(&delete.encode()).unwrap(), delete);

        assert!(SyncCommand::parse("HELLO|x").is_none());
        assert!(SyncCommand::parse("UPDATE_AVAILABLE|p|h|notanumber").is_none());
        assert!(SyncCommand::parse("").is_none());
    }

    #[tokio::test]
    async fn test_initial_scan_respects_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("node_modules/foo")).unwrap();
        std::fs::write(root.join("node_modules/foo/index.js"), b"js").unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/main.c"), b"int main(){}").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), b"ref").unwrap();
        std::fs::write(root.join("file.tmp"), b"scratch").unwrap();

        let network = make_network("peer-scan");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), true);

        let summary = dispatcher.initial_scan();
        assert_eq!(summary.scanned, 1);
        assert!(summary.ignored >= 3);

        let files = network.storage().files_in(root).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("src/main.c"));
        assert!(!files[0].synced);
    }

    #[tokio::test]
    async fn test_modify_with_no_peers_marks_synced() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"contents").unwrap();

        let network = make_network("peer-lonely");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), true);

        dispatcher
            .handle_event(ChangeEvent::Modified(root.join("a.txt")))
            .await;

        let record = network
            .storage()
            .file(&root.join("a.txt"))
            .unwrap()
            .unwrap();
        assert!(record.synced);
    }

    #[tokio::test]
    async fn test_paused_sync_updates_db_without_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"contents").unwrap();

        let network = make_network("peer-paused");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), false);

        dispatcher
            .handle_event(ChangeEvent::Modified(root.join("a.txt")))
            .await;

        let record = network
            .storage()
            .file(&root.join("a.txt"))
            .unwrap()
            .unwrap();
        // Recorded but not synced: no broadcast happened.
        assert!(!record.synced);
        assert_eq!(network.metrics().snapshot().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_ignored_paths_produce_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("junk.tmp"), b"x").unwrap();

        let network = make_network("peer-x");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), true);

        dispatcher
            .handle_event(ChangeEvent::Created(root.join("junk.tmp")))
            .await;
        assert!(network.storage().file(&root.join("junk.tmp")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_on_modify_reaches_peer() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/a.txt"), b"payload bytes").unwrap();

        let alpha = make_network("peer-alpha");
        let beta = make_network("peer-beta");
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = beta.bus().subscribe(
            topics::MESSAGE,
            Arc::new(move |event| {
                if let BusEvent::Message { payload, .. } = event {
                    sink.lock().unwrap().push(String::from_utf8_lossy(payload).to_string());
                }
            }),
        );

        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.is_connected("peer-beta")).await;
        }

        let dispatcher = FileSyncDispatcher::new(alpha.clone(), root.to_path_buf(), true);
        dispatcher
            .handle_event(ChangeEvent::Modified(root.join("src/a.txt")))
            .await;

        let probe = received.clone();
        wait_until(move || !probe.lock().unwrap().is_empty()).await;

        let got = received.lock().unwrap();
        let expected_hash = crate::hasher::hash_bytes(b"payload bytes");
        assert_eq!(
            got[0],
            format!("UPDATE_AVAILABLE|src/a.txt|{expected_hash}|13")
        );

        // Synced after one accepted delivery.
        let record = alpha
            .storage()
            .file(&root.join("src/a.txt"))
            .unwrap()
            .unwrap();
        assert!(record.synced);
        assert_eq!(alpha.metrics().snapshot().files_synced, 1);

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("gone.txt"), b"bye").unwrap();

        let alpha = make_network("peer-alpha");
        let beta = make_network("peer-beta");
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = beta.bus().subscribe(
            topics::MESSAGE,
            Arc::new(move |event| {
                if let BusEvent::Message { payload, .. } = event {
                    sink.lock().unwrap().push(String::from_utf8_lossy(payload).to_string());
                }
            }),
        );

        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();
        {
            let alpha_ref = &alpha;
            wait_until(move || alpha_ref.is_connected("peer-beta")).await;
        }

        let dispatcher = FileSyncDispatcher::new(alpha.clone(), root.to_path_buf(), true);
        dispatcher.initial_scan();

        std::fs::remove_file(root.join("gone.txt")).unwrap();
        dispatcher
            .handle_event(ChangeEvent::Deleted(root.join("gone.txt")))
            .await;

        let probe = received.clone();
        wait_until(move || !probe.lock().unwrap().is_empty()).await;
        assert_eq!(received.lock().unwrap()[0], "DELETE_FILE|gone.txt");
        assert!(alpha.storage().file(&root.join("gone.txt")).unwrap().is_none());

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_catchup_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("inventory.txt"), b"known file").unwrap();

        let alpha = make_network("peer-alpha");
        let beta = make_network("peer-beta");
        alpha.start().await.unwrap();
        beta.start().await.unwrap();

        let dispatcher = FileSyncDispatcher::new(alpha.clone(), root.to_path_buf(), true);
        dispatcher.initial_scan();
        let _catchup = dispatcher.clone().start_catchup();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = beta.bus().subscribe(
            topics::MESSAGE,
            Arc::new(move |event| {
                if let BusEvent::Message { payload, .. } = event {
                    sink.lock().unwrap().push(String::from_utf8_lossy(payload).to_string());
                }
            }),
        );

        // Connecting triggers the catch-up toward the new peer.
        let port = beta.tcp_listen_port();
        alpha.connect("127.0.0.1", port).await.unwrap();

        let probe = received.clone();
        wait_until(move || !probe.lock().unwrap().is_empty()).await;
        assert!(received.lock().unwrap()[0].starts_with("UPDATE_AVAILABLE|inventory.txt|"));

        alpha.shutdown().await;
        beta.shutdown().await;
    }

    #[tokio::test]
    async fn test_rename_is_delete_plus_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("old.txt"), b"data").unwrap();

        let network = make_network("peer-rn");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), true);
        dispatcher.initial_scan();

        std::fs::rename(root.join("old.txt"), root.join("new.txt")).unwrap();
        dispatcher
            .handle_event(ChangeEvent::Renamed {
                from: root.join("old.txt"),
                to: root.join("new.txt"),
            })
            .await;

        assert!(network.storage().file(&root.join("old.txt")).unwrap().is_none());
        assert!(network.storage().file(&root.join("new.txt")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_directory_event_rescans_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let network = make_network("peer-dir");
        let dispatcher = FileSyncDispatcher::new(network.clone(), root.to_path_buf(), true);

        // A tree moved into place after the initial scan.
        std::fs::create_dir_all(root.join("incoming/deep")).unwrap();
        std::fs::write(root.join("incoming/deep/a.bin"), b"a").unwrap();
        std::fs::write(root.join("incoming/b.bin"), b"b").unwrap();

        dispatcher
            .handle_event(ChangeEvent::Created(root.join("incoming")))
            .await;

        let files = network.storage().files_in(root).unwrap();
        assert_eq!(files.len(), 2);
    }
}
