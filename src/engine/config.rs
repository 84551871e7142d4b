//! Configuration for the dispatch engine
//!
//! [`ForgeConfig`] controls the primitive cache bound, whether constant
//! weights are cached in their reordered layout, and whether the CPU backend
//! parallelizes over the outermost output dimension.

use crate::error::{ForgeError, ForgeResult};

/// Default number of primitives retained before LRU eviction.
pub const DEFAULT_PRIMITIVE_CACHE_CAPACITY: usize = 1024;

const CACHE_CAPACITY_ENV: &str = "PRIMFORGE_PRIMITIVE_CACHE_CAPACITY";
const WEIGHT_CACHE_ENV: &str = "PRIMFORGE_WEIGHT_CACHE";
const PARALLEL_ENV: &str = "PRIMFORGE_PARALLEL";

/// Configuration for the dispatch engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeConfig {
    /// Maximum number of cached primitives; `None` means unbounded
    pub primitive_cache_capacity: Option<usize>,

    /// Cache reordered constant weights per kernel instance
    pub weight_cache_enabled: bool,

    /// Let the CPU backend split work across the rayon pool
    pub parallel_execution: bool,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        ForgeConfig {
            primitive_cache_capacity: Some(DEFAULT_PRIMITIVE_CACHE_CAPACITY),
            weight_cache_enabled: true,
            parallel_execution: true,
        }
    }
}

impl ForgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the primitive cache; `0` removes the bound
    pub fn with_primitive_cache_capacity(mut self, capacity: usize) -> Self {
        self.primitive_cache_capacity = if capacity == 0 { None } else { Some(capacity) };
        self
    }

    pub fn with_weight_cache(mut self, enabled: bool) -> Self {
        self.weight_cache_enabled = enabled;
        self
    }

    pub fn with_parallel_execution(mut self, enabled: bool) -> Self {
        self.parallel_execution = enabled;
        self
    }

    /// Read overrides from `PRIMFORGE_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are rejected.
    pub fn from_env() -> ForgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> ForgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ForgeConfig::default();

        if let Some(raw) = lookup(CACHE_CAPACITY_ENV) {
            let capacity = raw.trim().parse::<usize>().map_err(|_| {
                ForgeError::InvalidConfiguration(format!(
                    "{} must be a non-negative integer, got '{}'",
                    CACHE_CAPACITY_ENV, raw
                ))
            })?;
            config = config.with_primitive_cache_capacity(capacity);
        }
        if let Some(raw) = lookup(WEIGHT_CACHE_ENV) {
            config = config.with_weight_cache(parse_flag(WEIGHT_CACHE_ENV, &raw)?);
        }
        if let Some(raw) = lookup(PARALLEL_ENV) {
            config = config.with_parallel_execution(parse_flag(PARALLEL_ENV, &raw)?);
        }

        Ok(config)
    }
}

fn parse_flag(key: &str, raw: &str) -> ForgeResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(ForgeError::InvalidConfiguration(format!(
            "{} must be a boolean flag, got '{}'",
            key, other
        ))),
    }
}
