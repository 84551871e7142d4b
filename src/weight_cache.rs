//! Per-kernel cache of constant weights in the primitive's preferred layout.
//!
//! The first call that sees an empty cache converts the weights once under
//! the exclusive lock; every later call only takes the shared lock. The
//! stored buffer carries the memory descriptor it was produced for, and a
//! request for another descriptor gets `None` (the caller then reorders for
//! that call only). A populated cache is never overwritten.

use crate::error::{ForgeError, ForgeResult};
use crate::memory::MemoryDesc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, TryLockError};
use tracing::{debug, info};

/// Observable state of a [`WeightCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightCacheState {
    Empty,
    /// Exclusive lock held by a converting thread
    Converting,
    Cached,
}

/// Converted weights and the layout they were converted to
#[derive(Debug, Clone)]
pub struct CachedWeight {
    pub buffer: Arc<[f32]>,
    pub fingerprint: MemoryDesc,
}

#[derive(Debug, Default)]
pub struct WeightCache {
    slot: RwLock<Option<CachedWeight>>,
    conversions: AtomicU64,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared-lock emptiness check
    pub fn is_empty(&self) -> ForgeResult<bool> {
        Ok(self.slot.read()?.is_none())
    }

    pub fn state(&self) -> ForgeResult<WeightCacheState> {
        match self.slot.try_read() {
            Ok(slot) if slot.is_some() => Ok(WeightCacheState::Cached),
            Ok(_) => Ok(WeightCacheState::Empty),
            Err(TryLockError::WouldBlock) => Ok(WeightCacheState::Converting),
            Err(TryLockError::Poisoned(err)) => Err(ForgeError::from(err)),
        }
    }

    /// Cached buffer for `fingerprint`, converting on first use.
    ///
    /// `convert` runs at most once over the life of the cache, under the
    /// exclusive lock, and only while the cache is still empty.
    pub fn ensure_cached<F>(&self, fingerprint: &MemoryDesc, convert: F) -> ForgeResult<Option<Arc<[f32]>>>
    where
        F: FnOnce() -> ForgeResult<Vec<f32>>,
    {
        if self.is_empty()? {
            self.populate(fingerprint, convert)?;
        }
        self.lookup(fingerprint)
    }

    fn populate<F>(&self, fingerprint: &MemoryDesc, convert: F) -> ForgeResult<()>
    where
        F: FnOnce() -> ForgeResult<Vec<f32>>,
    {
        let mut slot = self.slot.write()?;
        if slot.is_some() {
            debug!("weights were cached by another thread");
            return Ok(());
        }
        let buffer: Arc<[f32]> = convert()?.into();
        self.conversions.fetch_add(1, Ordering::Relaxed);
        info!(layout = %fingerprint, elements = buffer.len(), "constant weights cached");
        *slot = Some(CachedWeight {
            buffer,
            fingerprint: fingerprint.clone(),
        });
        Ok(())
    }

    /// Buffer stored for exactly `fingerprint`, if any
    pub fn lookup(&self, fingerprint: &MemoryDesc) -> ForgeResult<Option<Arc<[f32]>>> {
        let slot = self.slot.read()?;
        Ok(match slot.as_ref() {
            Some(cached) if cached.fingerprint == *fingerprint => Some(Arc::clone(&cached.buffer)),
            _ => None,
        })
    }

    pub fn cached_fingerprint(&self) -> ForgeResult<Option<MemoryDesc>> {
        Ok(self.slot.read()?.as_ref().map(|c| c.fingerprint.clone()))
    }

    /// Number of conversions performed; at most one
    pub fn conversions(&self) -> u64 {
        self.conversions.load(Ordering::Relaxed)
    }
}
