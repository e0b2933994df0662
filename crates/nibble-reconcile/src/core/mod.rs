//! Core abstractions for source-agnostic reconciliation.
//!
//! - [`key`]: ordered row identifiers
//! - [`types`]: ranges, windows and digests exchanged with connectors
//! - [`traits`]: the [`Connector`] capability contract
//!
//! The engine only ever talks to data sources through [`Connector`], so new
//! sources can be added without touching the nibbling or comparison logic,
//! and core logic can be tested against in-memory implementations.

pub mod key;
pub mod traits;
pub mod types;

pub use key::Key;
pub use traits::Connector;
pub use types::{
    BatchDigest, Direction, KeyRange, NibbleProbe, RangeSummary, RowDigest, Window,
};
