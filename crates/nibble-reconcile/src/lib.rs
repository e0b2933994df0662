//! # nibble-reconcile
//!
//! Reconciles a master dataset against a replica ("slave") that should hold
//! the same rows, without loading either side into memory.
//!
//! - **Nibbling**: the key space is cut into windows by asking the master
//!   where the N-th row from the current position is, instead of paginating
//!   with offsets
//! - **Tiered compare**: aggregate digest first, per-row digests only for
//!   windows that differ, point lookups when a per-row fetch fails
//! - **Resume capability** via checkpoint stores and wall-clock deadlines
//! - **Source agnostic**: any data source implementing the eight-operation
//!   [`Connector`] trait can be reconciled
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nibble_reconcile::{checksum, MemoryConnector, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> nibble_reconcile::Result<()> {
//!     let master = Arc::new(MemoryConnector::from_json_file("master", "master.json"));
//!     let slave = Arc::new(MemoryConnector::from_json_file("slave", "slave.json"));
//!
//!     let report = checksum("orders", "orders-nightly", master, slave, RunOptions::default()).await?;
//!     println!("{}", report.totals);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod nibbler;
pub mod reconcile;
pub mod retry;

// Re-exports for convenient access
pub use checkpoint::{
    Checkpoint, CheckpointStore, Deadline, FileCheckpointStore, MemoryCheckpointStore,
    NoOpCheckpointStore,
};
pub use config::{Config, DatasetConfig, RunOptions};
pub use connectors::{FaultInjector, MemoryConnector, Operation};
pub use crate::core::{
    BatchDigest, Connector, Direction, Key, KeyRange, NibbleProbe, RangeSummary, RowDigest, Window,
};
pub use error::{ReconcileError, Result};
pub use nibbler::Nibbler;
pub use reconcile::{
    checksum, verify_ids, ChecksumReport, Classification, DeletionBatch, ProgressUpdate,
    ReconcileEngine, RunPhase, RunStatus, Totals, VerifiedId,
};
pub use retry::RetryPolicy;
