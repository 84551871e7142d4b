//! `_FusedMatMulGrad`: weight and bias gradients of a fused matmul.
//!
//! Output 0 is the weight gradient in the forward weights layout, output 1
//! the bias gradient. The weight gradient runs as an inner-product
//! backward-weights primitive; the bias gradient is the per-channel sum of
//! `diff_dst` over the batch.

use super::{element_type, prepare_source, report};
use crate::engine::Engine;
use crate::error::{ForgeError, ForgeResult};
use crate::framework::{AttrMap, OpKernelContext};
use crate::matmul::{plan_matmul_grad, MatMulGradOutcome, MatMulGradRequest};
use crate::memory::DType;
use crate::primitive::ExecArgs;
use std::sync::Arc;
use tracing::{debug, info, trace};

const OP_NAME: &str = "_FusedMatMulGrad";

/// Inputs are `src` and `diff_dst [batch, channel]`
#[derive(Debug)]
pub struct FusedMatMulGradKernel {
    transpose_a: bool,
    transpose_b: bool,
    element_type: DType,
    engine: Arc<Engine>,
}

impl FusedMatMulGradKernel {
    pub fn configure(attrs: &AttrMap) -> ForgeResult<Self> {
        Self::configure_with_engine(attrs, Engine::global())
    }

    pub fn configure_with_engine(attrs: &AttrMap, engine: Arc<Engine>) -> ForgeResult<Self> {
        let fused_ops = attrs.get_str_list("fused_ops")?;
        match fused_ops.as_slice() {
            [op] if op == "BiasAddGrad" => {}
            [op] => {
                return Err(ForgeError::UnsupportedFusion(format!(
                    "{} only fuses BiasAddGrad, got {}",
                    OP_NAME, op
                )))
            }
            _ => {
                return Err(ForgeError::InvalidConfiguration(format!(
                    "{} takes exactly one fused op, got {:?}",
                    OP_NAME, fused_ops
                )))
            }
        }
        let transpose_a = attrs.get_opt_bool("transpose_a")?.unwrap_or(false);
        let transpose_b = attrs.get_opt_bool("transpose_b")?.unwrap_or(false);

        info!(transpose_a, transpose_b, "matmul gradient kernel configured");
        Ok(Self {
            transpose_a,
            transpose_b,
            element_type: element_type(attrs)?,
            engine,
        })
    }

    pub fn compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) {
        let result = self.try_compute(ctx);
        report(ctx, OP_NAME, result);
    }

    pub fn try_compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) -> ForgeResult<()> {
        let src = ctx.input(0)?.clone();
        let diff_dst = ctx.input(1)?.clone();

        let plan = match plan_matmul_grad(&MatMulGradRequest {
            transpose_a: self.transpose_a,
            transpose_b: self.transpose_b,
            src_shape: src.shape(),
            diff_dst_shape: diff_dst.shape(),
            element_type: self.element_type,
        })? {
            MatMulGradOutcome::Empty {
                diff_weights_shape,
                diff_bias_shape,
            } => {
                debug!(shape = ?diff_weights_shape, "empty matmul gradient, skipping execution");
                ctx.allocate_output(0, &diff_weights_shape)?;
                return ctx.allocate_output(1, &diff_bias_shape);
            }
            MatMulGradOutcome::Compute(plan) => plan,
        };

        let primitive = self.engine.primitive(&plan.descriptor)?;
        let src_data = prepare_source(
            self.engine.backend(),
            src.as_f32()?,
            &plan.src_desc,
            primitive.src_desc(),
        )?;
        let diff_dst_data = diff_dst.as_f32()?;

        ctx.allocate_output(0, &plan.diff_weights_shape)?;
        let diff_weights = ctx.output_mut(0)?.as_f32_mut()?;
        primitive.execute(&ExecArgs::backward_weights(&src_data, diff_dst_data), diff_weights)?;

        let channels = plan.diff_bias_shape[0];
        ctx.allocate_output(1, &plan.diff_bias_shape)?;
        let diff_bias = ctx.output_mut(1)?.as_f32_mut()?;
        sum_over_batch(diff_dst_data, channels, diff_bias);
        trace!(shape = ?plan.diff_weights_shape, "matmul gradient done");
        Ok(())
    }
}

/// Column sums of a row-major `[batch, channels]` matrix
fn sum_over_batch(diff_dst: &[f32], channels: usize, out: &mut [f32]) {
    out.fill(0.0);
    for row in diff_dst.chunks_exact(channels) {
        for (acc, &g) in out.iter_mut().zip(row) {
            *acc += g;
        }
    }
}
