//! Error types for the reconciliation library.

use thiserror::Error;

use crate::reconcile::Totals;

/// Main error type for reconciliation operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection or session failure. Fatal for the run.
    #[error("Connection error on {connector}: {message}")]
    Connection { connector: String, message: String },

    /// A single query failed. Retried at the same window size.
    #[error("Query failed on {connector}: {message}")]
    Query { connector: String, message: String },

    /// Per-row digest payload exceeded what the connector can return.
    #[error("Payload too large on {connector}: {rows} rows in window")]
    PayloadTooLarge { connector: String, rows: u64 },

    /// Connector returned a probe that breaks the ordering contract
    #[error("Connector {connector} violated the ordering contract: {message}")]
    Contract { connector: String, message: String },

    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Config hash mismatch when reading a signed checkpoint file
    #[error("Config has changed since the checkpoint was written - cannot resume. Remove the checkpoint file to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (SIGINT, etc.)
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// A fatal error stopped the run; carries the totals accumulated so far.
    #[error("Run aborted (correct: {}, incorrect: {}, missing: {}): {source}", totals.correct, totals.incorrect, totals.missing)]
    Aborted {
        totals: Totals,
        #[source]
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    /// Create a Connection error
    pub fn connection(connector: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Connection {
            connector: connector.into(),
            message: message.into(),
        }
    }

    /// Create a Query error
    pub fn query(connector: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Query {
            connector: connector.into(),
            message: message.into(),
        }
    }

    /// Create a PayloadTooLarge error
    pub fn payload_too_large(connector: impl Into<String>, rows: u64) -> Self {
        ReconcileError::PayloadTooLarge {
            connector: connector.into(),
            rows,
        }
    }

    /// Create a Contract error
    pub fn contract(connector: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Contract {
            connector: connector.into(),
            message: message.into(),
        }
    }

    /// Wrap a fatal error together with the partial totals of the run.
    pub fn aborted(totals: Totals, source: ReconcileError) -> Self {
        ReconcileError::Aborted {
            totals,
            source: Box::new(source),
        }
    }

    /// Whether the error must stop the whole run.
    ///
    /// Query and payload errors only affect the window they occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Query { .. } | ReconcileError::PayloadTooLarge { .. }
        )
    }

    /// Whether the operation may be retried at the same window size.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Query { .. })
    }

    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, ReconcileError::PayloadTooLarge { .. })
    }

    /// Partial totals carried by an aborted run, if any.
    pub fn partial_totals(&self) -> Option<&Totals> {
        match self {
            ReconcileError::Aborted { totals, .. } => Some(totals),
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReconcileError::Config(_) | ReconcileError::ConfigChanged => 2,
            ReconcileError::Connection { .. } => 3,
            ReconcileError::Aborted { .. } => 4,
            ReconcileError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;
