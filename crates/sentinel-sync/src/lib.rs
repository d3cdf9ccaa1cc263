//! # SentinelFS Sync
//!
//! Filesystem-change dispatch for the SentinelFS daemon.
//!
//! This crate provides:
//! - **Ignore rules**: basename globs, relative-path globs and
//!   directory-suffix patterns, with a built-in default set always applied
//! - **Content hashing**: chunked SHA-256 of file contents
//! - **Change dispatch**: change events → ignore filter → metadata →
//!   storage upsert → broadcast to every known peer through the network
//!   façade
//! - **On-connect catch-up**: newly connected peers receive the full
//!   known-file inventory
//! - **Polling change producer**: a portable mtime/size differ feeding the
//!   dispatcher where no native watcher is wired in
//!
//! The dispatcher consumes a change-event stream rather than a platform
//! watcher directly; inotify/FSEvents/ReadDirectoryChangesW adapters feed
//! the same [`ChangeEvent`] channel.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod hasher;
pub mod ignore;
pub mod poll;

pub use dispatcher::{ChangeEvent, FileSyncDispatcher, ScanSummary, SyncCommand};
pub use hasher::hash_file;
pub use ignore::{DEFAULT_IGNORE_PATTERNS, IgnoreMatcher};
pub use poll::PollWatcher;
