//! primforge - primitive caching and fused-operator dispatch
//!
//! Convolution and matrix-multiplication kernels that describe each call as
//! an [`OperationDescriptor`], reuse a compiled [`Primitive`] for every
//! equal descriptor, and cache constant weights in the layout the primitive
//! prefers. Fusion of bias-add, activation, residual-add and padding is
//! validated against a closed set of legal combinations.
//!
//! Pipeline of one call:
//! validator ([`conv::validate`]) → descriptor builder ([`conv::descriptor`],
//! [`matmul`]) → fusion policy ([`fusion`]) → primitive cache
//! ([`primitive::cache`]) → weight cache ([`weight_cache`]) → executor
//! ([`primitive::executor`]).

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)] // index loops mirror the tensor math

pub mod backend;
pub mod conv;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod framework;
pub mod fusion;
pub mod kernel;
pub mod logging;
pub mod matmul;
pub mod memory;
pub mod primitive;
pub mod weight_cache;

pub use backend::{ComputeBackend, CpuBackend};
pub use descriptor::{ActivationAlgorithm, OpKind, OperationDescriptor, PostOp};
pub use engine::{CacheStats, Engine, ForgeConfig};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use framework::{AttrMap, HostContext, OpKernelContext, Tensor};
pub use fusion::{FusionConfig, FusionPolicy};
pub use kernel::{
    BackpropKind, ConvBackpropKernel, ConvKernel, ConvOp, FusedMatMulGradKernel, FusedMatMulKernel,
};
pub use memory::{DType, FormatTag, MemoryDesc};
pub use primitive::{Primitive, PrimitiveCache};
pub use weight_cache::{WeightCache, WeightCacheState};
