//! Compute backends
//!
//! A backend turns an [`OperationDescriptor`] into a [`Primitive`] and
//! converts buffers between memory layouts. [`CpuBackend`] is the reference
//! implementation.

pub mod cpu;

pub use cpu::CpuBackend;

use crate::descriptor::OperationDescriptor;
use crate::error::ForgeResult;
use crate::memory::{self, MemoryDesc};
use crate::primitive::Primitive;
use std::fmt;

/// Primitive factory and layout converter
pub trait ComputeBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Build a primitive for `descriptor`.
    ///
    /// Resolves `Any` formats to the backend's preferred layouts. Returns
    /// `BackendRejected` for configurations the backend cannot run.
    fn create_primitive(&self, descriptor: &OperationDescriptor) -> ForgeResult<Primitive>;

    /// Convert `data` from layout `from` to layout `to`
    fn reorder(&self, data: &[f32], from: &MemoryDesc, to: &MemoryDesc) -> ForgeResult<Vec<f32>> {
        memory::reorder(data, from, to)
    }
}
