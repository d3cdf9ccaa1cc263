//! # SentinelFS Core
//!
//! Orchestration layer of the SentinelFS daemon.
//!
//! This crate provides:
//! - **Session manager**: session-code keys, envelope encryption with
//!   replay counters, rotation with a grace window, handshake digests
//! - **Network façade**: the single surface upper layers use to connect,
//!   send, listen, announce and measure; fans transport events onto the
//!   bus
//! - **Event bus**: in-process typed publish/subscribe by topic
//! - **Metrics**: atomic counters, EWMA gauges, active transfers,
//!   Prometheus-style text export
//! - **Storage gateway**: narrow trait over peer and file tables plus an
//!   in-memory implementation with transactional batches
//! - **Configuration**: TOML-backed daemon options with validation
//!
//! ## Dataflow
//!
//! ```text
//! dispatcher ──▶ NetworkService::send ──▶ SessionManager (seal)
//!                      │                        │
//!                      ▼                        ▼
//!               TransportRegistry ──▶ selected transport ──▶ wire
//!
//! wire ──▶ transport event ──▶ decrypt ──▶ EventBus ──▶ consumers
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod metrics;
pub mod network;
pub mod session;
pub mod storage;

pub use bus::{BusEvent, EventBus, Subscription, topics};
pub use config::{ConfigError, DaemonConfig};
pub use metrics::{Metrics, MetricsSnapshot};
pub use network::{NetworkError, NetworkService};
pub use session::{AuthState, SessionError, SessionManager};
pub use storage::{
    BatchOp, FileRecord, MemoryStore, PeerRecord, PeerStatus, StorageError, StorageGateway,
};
