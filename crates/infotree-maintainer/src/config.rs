//! Maintainer configuration, loaded from TOML.
//!
//! ```toml
//! queue_capacity = 1024
//! branch_lifetime = "10s"
//! shutdown_timeout = "5s"
//!
//! [[metadata]]
//! path = "pools.*"
//! attributes = { class = "pool" }
//! ```

use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use infotree_state::{MetadataRegistry, Predicate};

use crate::error::{MaintainerError, MaintainerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintainerConfig {
    /// Bound of the update queue.
    pub queue_capacity: usize,
    /// Lifetime of branches created implicitly on the way to an upsert.
    pub branch_lifetime: String,
    /// How long shutdown waits for queued updates to drain.
    pub shutdown_timeout: String,
    pub metadata: Vec<MetadataRule>,
}

/// Attributes attached to every branch whose path matches `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRule {
    pub path: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            branch_lifetime: "10s".to_string(),
            shutdown_timeout: "5s".to_string(),
            metadata: Vec::new(),
        }
    }
}

impl MaintainerConfig {
    /// Load and validate a TOML config file.
    pub fn from_file(path: &FsPath) -> MaintainerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MaintainerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(s: &str) -> MaintainerResult<Self> {
        let config: MaintainerConfig =
            toml::from_str(s).map_err(|e| MaintainerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render this config as TOML.
    pub fn to_toml_string(&self) -> MaintainerResult<String> {
        toml::to_string_pretty(self).map_err(|e| MaintainerError::Config(e.to_string()))
    }

    /// Check every field that is only interpreted later.
    pub fn validate(&self) -> MaintainerResult<()> {
        if self.queue_capacity == 0 {
            return Err(MaintainerError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        self.branch_lifetime()?;
        self.shutdown_timeout()?;
        self.metadata_registry()?;
        Ok(())
    }

    /// Parsed `branch_lifetime`.
    pub fn branch_lifetime(&self) -> MaintainerResult<Duration> {
        parse_duration(&self.branch_lifetime)
    }

    /// Parsed `shutdown_timeout`.
    pub fn shutdown_timeout(&self) -> MaintainerResult<Duration> {
        parse_duration(&self.shutdown_timeout)
    }

    /// Build the branch metadata rules, in file order.
    pub fn metadata_registry(&self) -> MaintainerResult<MetadataRegistry> {
        let mut registry = MetadataRegistry::new();
        for rule in &self.metadata {
            let predicate = Predicate::parse(&rule.path)
                .map_err(|e| MaintainerError::Config(format!("metadata rule: {e}")))?;
            registry.add_rule(predicate, rule.attributes.clone());
        }
        Ok(registry)
    }
}

/// Parse `"500ms"`, `"2s"` or `"5m"`.
pub fn parse_duration(s: &str) -> MaintainerResult<Duration> {
    let s = s.trim();
    let invalid = || MaintainerError::Config(format!("invalid duration: {s:?}"));

    let (digits, unit): (&str, fn(u64) -> Option<Duration>) =
        if let Some(ms) = s.strip_suffix("ms") {
            (ms, |n| Some(Duration::from_millis(n)))
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, |n| Some(Duration::from_secs(n)))
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, |n| n.checked_mul(60).map(Duration::from_secs))
        } else {
            return Err(invalid());
        };

    let n = digits.parse::<u64>().map_err(|_| invalid())?;
    unit(n).ok_or_else(invalid)
}
