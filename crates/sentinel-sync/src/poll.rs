//! Polling change producer.
//!
//! A portable fallback for platforms (or deployments) without a native
//! filesystem watcher wired in: snapshots the tree on an interval and
//! diffs mtime/size to synthesize [`ChangeEvent`]s. Native watcher
//! adapters feed the same channel and replace this wholesale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::dispatcher::ChangeEvent;
use crate::ignore::IgnoreMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    size: u64,
}

/// Interval-driven tree differ.
pub struct PollWatcher {
    root: PathBuf,
    interval: Duration,
    matcher: IgnoreMatcher,
    stop: watch::Sender<bool>,
}

impl PollWatcher {
    /// Create a watcher over `root` ticking every `interval`.
    #[must_use]
    pub fn new(root: PathBuf, interval: Duration, matcher: IgnoreMatcher) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            root,
            interval,
            matcher,
            stop,
        }
    }

    /// Stop the polling task.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Spawn the polling task, emitting events into `tx`.
    ///
    /// The first snapshot is taken silently; only subsequent differences
    /// produce events.
    pub fn spawn(&self, tx: mpsc::Sender<ChangeEvent>) -> tokio::task::JoinHandle<()> {
        let root = self.root.clone();
        let interval = self.interval;
        let matcher = self.matcher.clone();
        let mut stop_rx = self.stop.subscribe();

        tokio::spawn(async move {
            let mut previous = snapshot(&root, &matcher);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let current = snapshot(&root, &matcher);
                for event in diff(&previous, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
            debug!("poll watcher stopped");
        })
    }
}

fn snapshot(root: &Path, matcher: &IgnoreMatcher) -> HashMap<PathBuf, FileStamp> {
    let mut out = HashMap::new();
    collect(root, root, matcher, &mut out);
    out
}

fn collect(
    root: &Path,
    dir: &Path,
    matcher: &IgnoreMatcher,
    out: &mut HashMap<PathBuf, FileStamp>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if matcher.should_ignore(root, &path) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect(root, &path, matcher, out);
        } else if file_type.is_file() {
            if let Ok(meta) = entry.metadata() {
                out.insert(
                    path,
                    FileStamp {
                        modified: meta.modified().ok(),
                        size: meta.len(),
                    },
                );
            }
        }
    }
}

fn diff(
    previous: &HashMap<PathBuf, FileStamp>,
    current: &HashMap<PathBuf, FileStamp>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (path, stamp) in current {
        match previous.get(path) {
            None => events.push(ChangeEvent::Created(path.clone())),
            Some(old) if old != stamp => events.push(ChangeEvent::Modified(path.clone())),
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            events.push(ChangeEvent::Deleted(path.clone()));
        }
    }
    events
}
