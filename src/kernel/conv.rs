//! Forward convolution kernels, plain and fused.

use super::{
    activation_params, element_type, operand_count, prepare_source, prepare_weights, report,
    stage_summand,
};
use crate::config_error;
use crate::conv::{plan_forward, ConvAttrs, ConvForwardRequest, ConvPlan, PadAmounts};
use crate::engine::Engine;
use crate::error::{ForgeError, ForgeResult};
use crate::framework::{AttrMap, OpKernelContext, Tensor};
use crate::fusion::{FusionConfig, FusionPolicy, FusionRequest, OpFamily};
use crate::memory::DType;
use crate::primitive::ExecArgs;
use crate::weight_cache::WeightCache;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Node types served by [`ConvKernel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvOp {
    Conv2D,
    Conv3D,
    DepthwiseConv2dNative,
    FusedConv2D,
    FusedDepthwiseConv2dNative,
    PadWithFusedConv2D,
}

impl ConvOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Conv2D" => Some(ConvOp::Conv2D),
            "Conv3D" => Some(ConvOp::Conv3D),
            "DepthwiseConv2dNative" => Some(ConvOp::DepthwiseConv2dNative),
            "_FusedConv2D" => Some(ConvOp::FusedConv2D),
            "_FusedDepthwiseConv2dNative" => Some(ConvOp::FusedDepthwiseConv2dNative),
            "_PadWithFusedConv2D" => Some(ConvOp::PadWithFusedConv2D),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConvOp::Conv2D => "Conv2D",
            ConvOp::Conv3D => "Conv3D",
            ConvOp::DepthwiseConv2dNative => "DepthwiseConv2dNative",
            ConvOp::FusedConv2D => "_FusedConv2D",
            ConvOp::FusedDepthwiseConv2dNative => "_FusedDepthwiseConv2dNative",
            ConvOp::PadWithFusedConv2D => "_PadWithFusedConv2D",
        }
    }

    pub fn is_depthwise(&self) -> bool {
        matches!(
            self,
            ConvOp::DepthwiseConv2dNative | ConvOp::FusedDepthwiseConv2dNative
        )
    }

    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            ConvOp::FusedConv2D | ConvOp::FusedDepthwiseConv2dNative | ConvOp::PadWithFusedConv2D
        )
    }

    /// Takes a trailing int32 paddings tensor
    pub fn has_pad_input(&self) -> bool {
        matches!(self, ConvOp::PadWithFusedConv2D)
    }

    /// Rank of input, filter and strides
    pub fn rank(&self) -> usize {
        match self {
            ConvOp::Conv3D => 5,
            _ => 4,
        }
    }

    fn family(&self) -> OpFamily {
        match self {
            ConvOp::Conv2D | ConvOp::Conv3D | ConvOp::DepthwiseConv2dNative => OpFamily::Unfused,
            ConvOp::FusedConv2D | ConvOp::PadWithFusedConv2D => OpFamily::Convolution,
            ConvOp::FusedDepthwiseConv2dNative => OpFamily::DepthwiseConvolution,
        }
    }
}

/// One configured convolution node.
///
/// Inputs are `src, filter, [bias], [summand], [paddings]`; output 0 is the
/// destination in the node's data format.
#[derive(Debug)]
pub struct ConvKernel {
    op: ConvOp,
    attrs: ConvAttrs,
    fusion: FusionConfig,
    element_type: DType,
    weight_cache: Option<WeightCache>,
    engine: Arc<Engine>,
}

impl ConvKernel {
    /// Configure against the process-wide engine
    pub fn configure(op: ConvOp, attrs: &AttrMap) -> ForgeResult<Self> {
        Self::configure_with_engine(op, attrs, Engine::global())
    }

    pub fn configure_with_engine(op: ConvOp, attrs: &AttrMap, engine: Arc<Engine>) -> ForgeResult<Self> {
        let conv_attrs = ConvAttrs::from_attrs(attrs)?;
        if conv_attrs.rank() != op.rank() {
            return Err(config_error!(
                "{} takes {}-D strides, got {}",
                op.name(),
                op.rank(),
                conv_attrs.rank()
            ));
        }

        let fused_ops = if op.is_fused() {
            attrs.get_str_list("fused_ops")?
        } else {
            attrs.get_opt_str_list("fused_ops")?.unwrap_or_default()
        };
        let params = activation_params(attrs, &fused_ops)?;
        let num_args = operand_count(attrs, 0)?;
        let fusion = FusionPolicy::for_family(op.family()).resolve(&FusionRequest {
            fused_ops: &fused_ops,
            num_args,
            activation_params: &params,
            explicit_pad: op.has_pad_input(),
        })?;

        let filter_const = attrs.get_opt_bool("is_filter_const")?.unwrap_or(false);
        let weight_cache = (filter_const && engine.config().weight_cache_enabled).then(WeightCache::new);

        info!(
            op = op.name(),
            format = %conv_attrs.format,
            fusion = %fusion,
            cached_filter = weight_cache.is_some(),
            "convolution kernel configured"
        );
        Ok(Self {
            op,
            attrs: conv_attrs,
            fusion,
            element_type: element_type(attrs)?,
            weight_cache,
            engine,
        })
    }

    pub fn op(&self) -> ConvOp {
        self.op
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    /// Present only for constant filters with weight caching enabled
    pub fn weight_cache(&self) -> Option<&WeightCache> {
        self.weight_cache.as_ref()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Run one call; any failure is reported through `ctx`
    pub fn compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) {
        let result = self.try_compute(ctx);
        report(ctx, self.op.name(), result);
    }

    pub fn try_compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) -> ForgeResult<()> {
        let src = ctx.input(0)?.clone();
        let filter = ctx.input(1)?.clone();
        let bias = match self.fusion.has_bias() {
            true => Some(ctx.input(2)?.clone()),
            false => None,
        };
        let runtime_pads = match self.op.has_pad_input() {
            true => Some(self.read_paddings(ctx.input(self.paddings_index())?)?),
            false => None,
        };

        let post_ops = self.fusion.post_ops();
        let plan = plan_forward(&ConvForwardRequest {
            attrs: &self.attrs,
            depthwise: self.op.is_depthwise(),
            src_shape: src.shape(),
            filter_shape: filter.shape(),
            bias_shape: bias.as_ref().map(Tensor::shape),
            pads: runtime_pads.as_ref().or(self.attrs.explicit_pads.as_ref()),
            post_ops: &post_ops,
            element_type: self.element_type,
        })?;
        let plan = match plan {
            ConvPlan::Empty { dst_shape } => {
                debug!(op = self.op.name(), shape = ?dst_shape, "empty output, skipping execution");
                return ctx.allocate_output(0, &dst_shape);
            }
            ConvPlan::Compute(plan) => plan,
        };

        let primitive = self.engine.primitive(&plan.descriptor)?;
        let backend = self.engine.backend();
        let src_data = prepare_source(backend, src.as_f32()?, &plan.src_desc, primitive.src_desc())?;
        let weights = prepare_weights(
            backend,
            self.weight_cache.as_ref(),
            filter.as_f32()?,
            &plan.filter_desc,
            primitive.weights_desc(),
        )?;
        let bias_data = bias.as_ref().map(Tensor::as_f32).transpose()?;

        if self.fusion.has_residual() {
            stage_summand(ctx, self.summand_index(), &plan.dst_shape)?;
        } else {
            ctx.allocate_output(0, &plan.dst_shape)?;
        }
        let dst = ctx.output_mut(0)?.as_f32_mut()?;
        primitive.execute(&ExecArgs::forward(&src_data, &weights, bias_data), dst)?;
        trace!(op = self.op.name(), shape = ?plan.dst_shape, "convolution done");
        Ok(())
    }

    fn summand_index(&self) -> usize {
        2 + usize::from(self.fusion.has_bias())
    }

    fn paddings_index(&self) -> usize {
        2 + self.fusion.extra_operands()
    }

    /// `[rank, 2]` int32 tensor in the node's data format order
    fn read_paddings(&self, tensor: &Tensor) -> ForgeResult<PadAmounts> {
        let rank = self.attrs.rank();
        if tensor.shape() != [rank, 2] {
            return Err(ForgeError::ShapeMismatch(format!(
                "paddings must have shape [{}, 2], got {:?}",
                rank,
                tensor.shape()
            )));
        }
        let values: Vec<i64> = tensor.as_i32()?.iter().map(|&v| i64::from(v)).collect();
        PadAmounts::from_layout_list(self.attrs.format, &values)
    }
}
