//! Orderly – an in-memory FIFO queue broker.
//!
//! This crate exports
//!  * `core`     – wire protocol, framing and the queue engine
//!  * `broker`   – TCP server and per-connection command dispatch
//!  * `client`   – multiplexing client SDK
//!  * `snapshot` – periodic snapshot / restore / prune of queue state
//!  * `storage`  – blob stores the snapshots are written to
//!  * `config`   – TOML-driven runtime configuration
//!
//! Downstream applications can embed the broker (`run`) or build their own
//! binaries on top of the library.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod snapshot;
pub mod storage;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::run;
pub use client::{Client, ClientConfig, ClientError, Consumer};
pub use config::{load_config, Config};
pub use core::Queue;
pub use snapshot::{Snapshot, Snapshotter};
