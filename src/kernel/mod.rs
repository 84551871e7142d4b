//! Framework-facing kernels
//!
//! Each kernel is configured once from node attributes and then serves any
//! number of concurrent `compute` calls. A call walks the pipeline
//! validator → descriptor builder → primitive cache → weight cache →
//! executor, and reports at most one failure through the context.
//!
//! - [`conv`] - forward convolution family, fused and plain
//! - [`matmul`] - fused matrix multiplication
//! - [`matmul_grad`] - weight and bias gradients of the fused matmul
//! - [`backprop`] - convolution gradient entry points

pub mod backprop;
pub mod conv;
pub mod matmul;
pub mod matmul_grad;

pub use backprop::{BackpropKind, ConvBackpropKernel};
pub use conv::{ConvKernel, ConvOp};
pub use matmul::FusedMatMulKernel;
pub use matmul_grad::FusedMatMulGradKernel;

use crate::backend::ComputeBackend;
use crate::config_error;
use crate::error::{checked_element_count, ensure_addressable, ForgeError, ForgeResult};
use crate::framework::{AttrMap, OpKernelContext};
use crate::memory::{DType, MemoryDesc};
use crate::weight_cache::WeightCache;
use std::borrow::Cow;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

/// Element type named by the `T` attribute, `f32` when absent
pub(crate) fn element_type(attrs: &AttrMap) -> ForgeResult<DType> {
    match attrs.get_opt_str("T")? {
        None => Ok(DType::F32),
        Some(name) => DType::from_type_attr(&name)
            .ok_or_else(|| config_error!("unsupported element type '{}'", name)),
    }
}

/// Fused-activation parameters: `activation_params`, or the single
/// `leakyrelu_alpha` when the fused list names `LeakyRelu`
pub(crate) fn activation_params(attrs: &AttrMap, fused_ops: &[String]) -> ForgeResult<Vec<f32>> {
    if let Some(params) = attrs.get_opt_float_list("activation_params")? {
        return Ok(params);
    }
    match attrs.get_opt_float("leakyrelu_alpha")? {
        Some(alpha) if fused_ops.iter().any(|op| op == "LeakyRelu") => Ok(vec![alpha]),
        _ => Ok(Vec::new()),
    }
}

/// `num_args` as a count; negative values are a configuration error
pub(crate) fn operand_count(attrs: &AttrMap, default: i64) -> ForgeResult<usize> {
    let raw = attrs.get_opt_int("num_args")?.unwrap_or(default);
    usize::try_from(raw).map_err(|_| config_error!("num_args must be non-negative, got {}", raw))
}

/// Source data in the layout the primitive reads
pub(crate) fn prepare_source<'a>(
    backend: &dyn ComputeBackend,
    data: &'a [f32],
    user: &MemoryDesc,
    expected: Option<&MemoryDesc>,
) -> ForgeResult<Cow<'a, [f32]>> {
    let expected = expected
        .ok_or_else(|| ForgeError::Internal("primitive takes no source".to_string()))?;
    if expected == user {
        return Ok(Cow::Borrowed(data));
    }
    debug!(from = %user, to = %expected, "reordering source");
    Ok(Cow::Owned(backend.reorder(data, user, expected)?))
}

/// Weights as handed to the executor
#[derive(Debug)]
pub(crate) enum WeightsHandle<'a> {
    /// User buffer already in the primitive's layout
    User(&'a [f32]),
    /// Shared buffer from the kernel's weight cache
    Cached(Arc<[f32]>),
    /// Converted for this call only
    Reordered(Vec<f32>),
}

impl Deref for WeightsHandle<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match self {
            WeightsHandle::User(data) => data,
            WeightsHandle::Cached(data) => data,
            WeightsHandle::Reordered(data) => data,
        }
    }
}

/// Weights in the primitive's layout, through the cache when the kernel has one.
///
/// A cache populated for another layout is left alone; this call reorders
/// privately instead.
pub(crate) fn prepare_weights<'a>(
    backend: &dyn ComputeBackend,
    cache: Option<&WeightCache>,
    data: &'a [f32],
    user: &MemoryDesc,
    expected: Option<&MemoryDesc>,
) -> ForgeResult<WeightsHandle<'a>> {
    let expected = expected
        .ok_or_else(|| ForgeError::Internal("primitive takes no weights".to_string()))?;
    if expected == user {
        return Ok(WeightsHandle::User(data));
    }
    ensure_addressable("weights", user.element_count(), data.len())?;

    if let Some(cache) = cache {
        match cache.ensure_cached(expected, || backend.reorder(data, user, expected))? {
            Some(buffer) => return Ok(WeightsHandle::Cached(buffer)),
            None => {
                let cached = cache.cached_fingerprint()?;
                warn!(
                    requested = %expected,
                    cached = ?cached.map(|d| d.to_string()),
                    "weight cache holds another layout, reordering for this call"
                );
            }
        }
    }
    debug!(from = %user, to = %expected, "reordering weights");
    Ok(WeightsHandle::Reordered(backend.reorder(data, user, expected)?))
}

/// Place the residual operand in output 0.
///
/// Forwards the input buffer when the context allows it, otherwise
/// allocates the destination and copies the operand in.
pub(crate) fn stage_summand<C>(ctx: &mut C, input: usize, dst_shape: &[usize]) -> ForgeResult<()>
where
    C: OpKernelContext + ?Sized,
{
    if ctx.forward_input_to_output(input, 0, dst_shape)? {
        debug!(input, "residual operand forwarded into the destination");
        return Ok(());
    }

    let summand = ctx.input(input)?.clone();
    let values = summand.as_f32()?;
    let required = checked_element_count("output", dst_shape)?;
    ensure_addressable("summand", required, values.len())?;
    if values.len() != required {
        return Err(ForgeError::ShapeMismatch(format!(
            "summand {:?} does not match output {:?}",
            summand.shape(),
            dst_shape
        )));
    }
    ctx.allocate_output(0, dst_shape)?;
    ctx.output_mut(0)?.as_f32_mut()?.copy_from_slice(values);
    debug!(input, "residual operand copied into the destination");
    Ok(())
}

/// Collapse a call's result into the context's failure report
pub(crate) fn report<C>(ctx: &mut C, op: &str, result: ForgeResult<()>)
where
    C: OpKernelContext + ?Sized,
{
    if let Err(err) = result {
        if err.is_internal_error() {
            warn!(op, error = %err, "kernel failed");
        } else {
            debug!(op, error = %err, category = %err.category(), "kernel call rejected");
        }
        ctx.fail(err);
    }
}
