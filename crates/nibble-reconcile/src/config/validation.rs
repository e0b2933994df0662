//! Configuration validation.

use chrono::Utc;

use super::{Config, RunOptions};
use crate::error::{ReconcileError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.job_id.trim().is_empty() {
        return Err(ReconcileError::Config("job_id is required".into()));
    }
    if config.job_name.trim().is_empty() {
        return Err(ReconcileError::Config("job_name is required".into()));
    }

    if config.master.path.as_os_str().is_empty() {
        return Err(ReconcileError::Config("master.path is required".into()));
    }
    if config.slave.path.as_os_str().is_empty() {
        return Err(ReconcileError::Config("slave.path is required".into()));
    }

    // Cannot reconcile a dataset against itself
    if config.master.path == config.slave.path {
        return Err(ReconcileError::Config(
            "master and slave cannot be the same dataset".into(),
        ));
    }

    if let Some(0) = config.master.max_individual_rows {
        return Err(ReconcileError::Config(
            "master.max_individual_rows must be at least 1".into(),
        ));
    }
    if let Some(0) = config.slave.max_individual_rows {
        return Err(ReconcileError::Config(
            "slave.max_individual_rows must be at least 1".into(),
        ));
    }

    config.retry.validate()?;

    validate_options(&config.options)
}

/// Validate run options on their own (also used by library callers that
/// build `RunOptions` without a config file).
pub fn validate_options(options: &RunOptions) -> Result<()> {
    if options.limit == 0 {
        return Err(ReconcileError::Config("options.limit must be at least 1".into()));
    }
    if options.max_limit == 0 {
        return Err(ReconcileError::Config(
            "options.max_limit must be at least 1".into(),
        ));
    }
    if options.max_limit > options.limit {
        return Err(ReconcileError::Config(format!(
            "options.max_limit ({}) cannot exceed options.limit ({})",
            options.max_limit, options.limit
        )));
    }
    if options.deletion_batch_size == 0 {
        return Err(ReconcileError::Config(
            "options.deletion_batch_size must be at least 1".into(),
        ));
    }
    if options.stop_at.is_some() && options.max_duration_secs.is_some() {
        return Err(ReconcileError::Config(
            "set either options.stop_at or options.max_duration_secs, not both".into(),
        ));
    }
    if let Some(secs) = options.max_duration_secs {
        if options.resolve_stop_at(Utc::now()).is_none() {
            return Err(ReconcileError::Config(format!(
                "options.max_duration_secs ({}) is out of range",
                secs
            )));
        }
    }

    Ok(())
}
