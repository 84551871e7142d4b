//! Descriptor-keyed primitive cache.
//!
//! Equal descriptors share one `Arc<Primitive>`. Each key owns a `OnceCell`
//! so concurrent misses on the same key wait for a single build instead of
//! racing; the map itself sits behind a `Mutex` around an `LruCache`.

use super::Primitive;
use crate::backend::ComputeBackend;
use crate::descriptor::OperationDescriptor;
use crate::engine::stats::{CacheCounters, CacheStats};
use crate::error::ForgeResult;
use lru::LruCache;
use once_cell::sync::OnceCell;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Arc<Primitive>>>;

/// Bounded (or unbounded) map from descriptor to built primitive
#[derive(Debug)]
pub struct PrimitiveCache {
    entries: Mutex<LruCache<OperationDescriptor, Slot>>,
    capacity: Option<usize>,
    counters: CacheCounters,
}

impl PrimitiveCache {
    /// `None` keeps every primitive for the life of the cache
    pub fn new(capacity: Option<usize>) -> Self {
        let entries = match capacity.and_then(NonZeroUsize::new) {
            Some(bound) => LruCache::new(bound),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            capacity: capacity.filter(|&c| c > 0),
            counters: CacheCounters::default(),
        }
    }

    /// Return the primitive for `descriptor`, building it on first request.
    ///
    /// A backend refusal is returned as is and not retried for this call;
    /// the failed key is dropped so a later call may try again.
    pub fn get_or_create(
        &self,
        descriptor: &OperationDescriptor,
        backend: &dyn ComputeBackend,
    ) -> ForgeResult<Arc<Primitive>> {
        let slot = self.slot_for(descriptor)?;
        if let Some(primitive) = slot.get() {
            self.counters.record_hit();
            debug!(kind = descriptor.kind.name(), "primitive cache hit");
            return Ok(Arc::clone(primitive));
        }

        self.counters.record_miss();
        let built = slot.get_or_try_init(|| {
            let started = Instant::now();
            let primitive = backend.create_primitive(descriptor)?;
            self.counters.record_build();
            info!(
                backend = backend.name(),
                descriptor = %descriptor,
                elapsed_us = started.elapsed().as_micros() as u64,
                "primitive built"
            );
            Ok::<_, crate::error::ForgeError>(Arc::new(primitive))
        });

        match built {
            Ok(primitive) => Ok(Arc::clone(primitive)),
            Err(err) => {
                self.counters.record_build_failure();
                warn!(descriptor = %descriptor, error = %err, "primitive build failed");
                self.forget_failed(descriptor, &slot)?;
                Err(err)
            }
        }
    }

    fn slot_for(&self, descriptor: &OperationDescriptor) -> ForgeResult<Slot> {
        let mut entries = self.entries.lock()?;
        if let Some(slot) = entries.get(descriptor) {
            return Ok(Arc::clone(slot));
        }
        let slot: Slot = Arc::new(OnceCell::new());
        if let Some((evicted, _)) = entries.push(descriptor.clone(), Arc::clone(&slot)) {
            self.counters.record_eviction();
            debug!(kind = evicted.kind.name(), "primitive evicted");
        }
        Ok(slot)
    }

    fn forget_failed(&self, descriptor: &OperationDescriptor, slot: &Slot) -> ForgeResult<()> {
        let mut entries = self.entries.lock()?;
        let stale = entries
            .peek(descriptor)
            .map_or(false, |current| Arc::ptr_eq(current, slot) && current.get().is_none());
        if stale {
            entries.pop(descriptor);
        }
        Ok(())
    }

    pub fn contains(&self, descriptor: &OperationDescriptor) -> ForgeResult<bool> {
        Ok(self.entries.lock()?.contains(descriptor))
    }

    pub fn len(&self) -> ForgeResult<usize> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> ForgeResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Drop every cached primitive; handles already returned stay valid
    pub fn clear(&self) -> ForgeResult<()> {
        self.entries.lock()?.clear();
        Ok(())
    }

    pub fn stats(&self) -> ForgeResult<CacheStats> {
        let entries = self.len()?;
        Ok(self.counters.snapshot(entries, self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::sample_conv;
    use crate::error::ForgeError;
    use crate::primitive::{ArgDescs, ExecArgs, PrimitiveKernel};
    use crate::memory::{DType, FormatTag, MemoryDesc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoopKernel;

    impl PrimitiveKernel for NoopKernel {
        fn run(&self, _args: &ExecArgs<'_>, _dst: &mut [f32]) -> ForgeResult<()> {
            Ok(())
        }
    }

    /// Counts builds, optionally slow, optionally refusing
    #[derive(Debug, Default)]
    struct CountingBackend {
        builds: AtomicUsize,
        delay: Option<Duration>,
        refuse: bool,
    }

    impl ComputeBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn create_primitive(&self, descriptor: &OperationDescriptor) -> ForgeResult<Primitive> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.refuse {
                return Err(ForgeError::BackendRejected("no".to_string()));
            }
            let dst = MemoryDesc::new(vec![1], DType::F32, FormatTag::X)?;
            Ok(Primitive::new(
                descriptor.clone(),
                ArgDescs {
                    src: None,
                    weights: None,
                    bias: None,
                    diff_dst: None,
                    dst,
                },
                Box::new(NoopKernel),
            ))
        }
    }

    #[test]
    fn test_equal_descriptors_share_one_build() {
        let cache = PrimitiveCache::new(Some(8));
        let backend = CountingBackend::default();
        let a = cache.get_or_create(&sample_conv(), &backend).unwrap();
        let b = cache.get_or_create(&sample_conv(), &backend).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.builds.load(Ordering::SeqCst), 1);

        let stats = cache.stats().unwrap();
        assert_eq!((stats.hits, stats.misses, stats.builds, stats.entries), (1, 1, 1, 1));
    }

    #[test]
    fn test_distinct_descriptors_distinct_handles() {
        let cache = PrimitiveCache::new(None);
        let backend = CountingBackend::default();
        let mut other = sample_conv();
        other.strides = vec![2, 1];
        let a = cache.get_or_create(&sample_conv(), &backend).unwrap();
        let b = cache.get_or_create(&other, &backend).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PrimitiveCache::new(Some(1));
        let backend = CountingBackend::default();
        let mut other = sample_conv();
        other.padding_left = vec![1, 1];
        cache.get_or_create(&sample_conv(), &backend).unwrap();
        cache.get_or_create(&other, &backend).unwrap();
        assert!(!cache.contains(&sample_conv()).unwrap());
        assert_eq!(cache.stats().unwrap().evictions, 1);

        cache.get_or_create(&sample_conv(), &backend).unwrap();
        assert_eq!(backend.builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_misses_build_once() {
        let cache = Arc::new(PrimitiveCache::new(Some(4)));
        let backend = Arc::new(CountingBackend {
            delay: Some(Duration::from_millis(20)),
            ..CountingBackend::default()
        });
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (cache, backend, barrier) = (Arc::clone(&cache), Arc::clone(&backend), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_create(&sample_conv(), backend.as_ref()).unwrap()
                })
            })
            .collect();
        let primitives: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
        assert!(primitives.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_refusal_is_reported_and_not_cached() {
        let cache = PrimitiveCache::new(Some(4));
        let backend = CountingBackend {
            refuse: true,
            ..CountingBackend::default()
        };
        let err = cache.get_or_create(&sample_conv(), &backend).unwrap_err();
        assert!(matches!(err, ForgeError::BackendRejected(_)));
        assert!(cache.is_empty().unwrap());
        assert_eq!(cache.stats().unwrap().build_failures, 1);
    }

    #[test]
    fn test_clear_keeps_handles_alive() {
        let cache = PrimitiveCache::new(Some(4));
        let backend = CountingBackend::default();
        let handle = cache.get_or_create(&sample_conv(), &backend).unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
        assert_eq!(handle.descriptor(), &sample_conv());
    }
}
