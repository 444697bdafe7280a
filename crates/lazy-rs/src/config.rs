//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Result, RuntimeError};

/// Knobs controlling dispatch and scheduling.
///
/// Construct with [`RuntimeConfig::default`], load JSON with [`RuntimeConfig::from_json`], and
/// layer `LAZYRS_*` environment overrides on top with [`RuntimeConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Synchronize after every recorded operation.
    pub eager: bool,
    /// When disabled, compiled-capable nodes run (and are counted) on the fallback path.
    pub compile_enabled: bool,
    /// Maximum number of compiled regions kept in the per-arena cache.
    pub region_cache_capacity: usize,
    /// Upper bound on the number of nodes merged into one compiled region.
    pub max_region_nodes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            eager: false,
            compile_enabled: true,
            region_cache_capacity: 64,
            max_region_nodes: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json).map_err(|err| {
            RuntimeError::Config {
                reason: err.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied. Variables are read once per process.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(eager) = env::eager_override() {
            self.eager = eager;
        }
        if let Some(compile) = env::compile_override() {
            self.compile_enabled = compile;
        }
        if let Some(capacity) = env::region_cache_override() {
            self.region_cache_capacity = capacity;
        }
        if let Some(limit) = env::max_region_nodes_override() {
            self.max_region_nodes = limit;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region_cache_capacity == 0 {
            return Err(RuntimeError::Config {
                reason: "region_cache_capacity must be positive".into(),
            });
        }
        if self.max_region_nodes == 0 {
            return Err(RuntimeError::Config {
                reason: "max_region_nodes must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn compile_enabled(mut self, enabled: bool) -> Self {
        self.compile_enabled = enabled;
        self
    }

    pub fn max_region_nodes(mut self, limit: usize) -> Self {
        self.max_region_nodes = limit;
        self
    }

    pub fn region_cache_capacity(mut self, capacity: usize) -> Self {
        self.region_cache_capacity = capacity;
        self
    }
}
