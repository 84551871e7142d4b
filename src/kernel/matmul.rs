//! `_FusedMatMul`: matrix multiplication with bias and an optional activation.

use super::{activation_params, element_type, operand_count, prepare_source, prepare_weights, report};
use crate::config_error;
use crate::engine::Engine;
use crate::error::ForgeResult;
use crate::framework::{AttrMap, OpKernelContext};
use crate::fusion::{FusionConfig, FusionPolicy, FusionRequest, OpFamily};
use crate::matmul::{plan_matmul, MatMulOutcome, MatMulRequest};
use crate::memory::DType;
use crate::primitive::ExecArgs;
use crate::weight_cache::WeightCache;
use std::sync::Arc;
use tracing::{debug, info, trace};

const OP_NAME: &str = "_FusedMatMul";

/// Inputs are `src [batch, k], weights, bias [channel]`
#[derive(Debug)]
pub struct FusedMatMulKernel {
    transpose_b: bool,
    weights_const: bool,
    fusion: FusionConfig,
    element_type: DType,
    weight_cache: Option<WeightCache>,
    engine: Arc<Engine>,
}

impl FusedMatMulKernel {
    pub fn configure(attrs: &AttrMap) -> ForgeResult<Self> {
        Self::configure_with_engine(attrs, Engine::global())
    }

    pub fn configure_with_engine(attrs: &AttrMap, engine: Arc<Engine>) -> ForgeResult<Self> {
        if attrs.get_opt_bool("transpose_a")?.unwrap_or(false) {
            return Err(config_error!("In[0] of {} can't be transposed", OP_NAME));
        }
        let transpose_b = attrs.get_opt_bool("transpose_b")?.unwrap_or(false);
        let weights_const = attrs.get_opt_bool("is_filter_const")?.unwrap_or(false);

        let fused_ops = attrs.get_str_list("fused_ops")?;
        let params = activation_params(attrs, &fused_ops)?;
        let fusion = FusionPolicy::for_family(OpFamily::MatMul).resolve(&FusionRequest {
            fused_ops: &fused_ops,
            num_args: operand_count(attrs, 1)?,
            activation_params: &params,
            explicit_pad: false,
        })?;

        let weight_cache = (weights_const && engine.config().weight_cache_enabled).then(WeightCache::new);
        info!(
            fusion = %fusion,
            transpose_b,
            cached_weights = weight_cache.is_some(),
            "matmul kernel configured"
        );
        Ok(Self {
            transpose_b,
            weights_const,
            fusion,
            element_type: element_type(attrs)?,
            weight_cache,
            engine,
        })
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    pub fn weight_cache(&self) -> Option<&WeightCache> {
        self.weight_cache.as_ref()
    }

    pub fn compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) {
        let result = self.try_compute(ctx);
        report(ctx, OP_NAME, result);
    }

    pub fn try_compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) -> ForgeResult<()> {
        let src = ctx.input(0)?.clone();
        let weights = ctx.input(1)?.clone();
        let bias = ctx.input(2)?.clone();

        let post_ops = self.fusion.post_ops();
        let plan = match plan_matmul(&MatMulRequest {
            transpose_b: self.transpose_b,
            weights_const: self.weights_const,
            src_shape: src.shape(),
            weights_shape: weights.shape(),
            bias_shape: bias.shape(),
            post_ops: &post_ops,
            element_type: self.element_type,
        })? {
            MatMulOutcome::Empty { dst_shape } => {
                debug!(shape = ?dst_shape, "empty matmul output, skipping execution");
                return ctx.allocate_output(0, &dst_shape);
            }
            MatMulOutcome::Compute(plan) => plan,
        };

        let primitive = self.engine.primitive(&plan.descriptor)?;
        let backend = self.engine.backend();
        let src_data = prepare_source(backend, src.as_f32()?, &plan.src_desc, primitive.src_desc())?;
        let weights_data = prepare_weights(
            backend,
            self.weight_cache.as_ref(),
            weights.as_f32()?,
            &plan.weights_desc,
            primitive.weights_desc(),
        )?;

        ctx.allocate_output(0, &plan.dst_shape)?;
        let dst = ctx.output_mut(0)?.as_f32_mut()?;
        primitive.execute(
            &ExecArgs::forward(&src_data, &weights_data, Some(bias.as_f32()?)),
            dst,
        )?;
        trace!(shape = ?plan.dst_shape, "matmul done");
        Ok(())
    }
}
