//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::validate_options;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 over the fields that identify the job (id and datasets).
    ///
    /// Run options are left out so a resumed run may use a different
    /// deadline or window size.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.job_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.master.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.slave.path.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
