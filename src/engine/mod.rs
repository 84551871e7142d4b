//! Dispatch engine shared by kernel instances
//!
//! An [`Engine`] owns one compute backend and the primitive cache built on
//! top of it. Kernels hold an `Arc<Engine>`; by default they share the
//! process-wide instance from [`Engine::global`], and tests or embedders can
//! inject their own.
//!
//! ## Module Structure
//!
//! - [`config`] - Engine configuration and environment overrides
//! - [`stats`] - Cache counters and snapshots

pub mod config;
pub mod stats;

pub use config::ForgeConfig;
pub use stats::{CacheCounters, CacheStats};

use crate::backend::{ComputeBackend, CpuBackend};
use crate::descriptor::OperationDescriptor;
use crate::error::ForgeResult;
use crate::primitive::{Primitive, PrimitiveCache};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::{info, warn};

static GLOBAL_ENGINE: Lazy<Arc<Engine>> = Lazy::new(|| {
    let config = ForgeConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "ignoring malformed engine configuration");
        ForgeConfig::default()
    });
    Arc::new(Engine::new(config))
});

/// Backend plus primitive cache
#[derive(Debug)]
pub struct Engine {
    config: ForgeConfig,
    backend: Arc<dyn ComputeBackend>,
    primitives: PrimitiveCache,
}

impl Engine {
    /// Engine on the CPU backend
    pub fn new(config: ForgeConfig) -> Self {
        let backend = Arc::new(CpuBackend::with_parallel(config.parallel_execution));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: ForgeConfig, backend: Arc<dyn ComputeBackend>) -> Self {
        info!(
            backend = backend.name(),
            capacity = ?config.primitive_cache_capacity,
            weight_cache = config.weight_cache_enabled,
            "engine created"
        );
        Self {
            primitives: PrimitiveCache::new(config.primitive_cache_capacity),
            config,
            backend,
        }
    }

    /// Process-wide engine, configured from `PRIMFORGE_*` on first use
    pub fn global() -> Arc<Engine> {
        Arc::clone(&GLOBAL_ENGINE)
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    /// Cached primitive for `descriptor`, built on first request
    pub fn primitive(&self, descriptor: &OperationDescriptor) -> ForgeResult<Arc<Primitive>> {
        self.primitives.get_or_create(descriptor, self.backend.as_ref())
    }

    pub fn primitive_cache(&self) -> &PrimitiveCache {
        &self.primitives
    }

    pub fn stats(&self) -> ForgeResult<CacheStats> {
        self.primitives.stats()
    }
}
