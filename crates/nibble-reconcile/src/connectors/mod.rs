//! Connector implementations shipped with the library.
//!
//! Concrete database connectors live with their callers; this module only
//! carries the in-memory/flat-file reference connector and the fault
//! injecting decorator used to exercise degraded paths.

pub mod fault;
pub mod memory;

pub use fault::{FaultInjector, Operation, Override};
pub use memory::{row_hash, MemoryConnector};
