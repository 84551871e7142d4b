//! Reference CPU backend.
//!
//! Direct loops over stride-addressed buffers, so any supported layout runs
//! without an internal copy. Work is split across the rayon pool over the
//! outermost destination dimension when parallel execution is enabled.

mod conv;
mod geometry;
mod inner_product;
pub mod post_ops;

use self::conv::{ConvBackwardDataKernel, ConvBackwardWeightsKernel, ConvForwardKernel};
use self::geometry::{ActIndex, ConvGeometry, WeightIndex};
use self::inner_product::{InnerProductBackwardWeightsKernel, InnerProductKernel};
use self::post_ops::PostOpChain;
use super::ComputeBackend;
use crate::backend_error;
use crate::descriptor::{OpKind, OperationDescriptor};
use crate::error::ForgeResult;
use crate::memory::{DType, FormatTag, MemoryDesc};
use crate::primitive::{ArgDescs, Primitive, PrimitiveKernel};
use tracing::debug;

/// CPU implementation of [`ComputeBackend`]
#[derive(Debug, Clone)]
pub struct CpuBackend {
    parallel: bool,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel(parallel: bool) -> Self {
        Self { parallel }
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Layout chosen for weights requested as `Any`
    pub fn preferred_weights_format(kind: OpKind, groups: usize, spatial_rank: usize) -> FormatTag {
        match (kind, groups > 1, spatial_rank) {
            (OpKind::InnerProduct | OpKind::InnerProductBackwardWeights, _, _) => FormatTag::Oi,
            (_, true, _) => FormatTag::Goihw,
            (_, false, 3) => FormatTag::Oidhw,
            _ => FormatTag::Oihw,
        }
    }

    fn weights_desc(&self, desc: &OperationDescriptor) -> ForgeResult<MemoryDesc> {
        let format = match desc.weights_format {
            FormatTag::Any => Self::preferred_weights_format(desc.kind, desc.groups, desc.spatial_rank()),
            requested => requested,
        };
        MemoryDesc::new(desc.weights_dims.clone(), DType::F32, format).map_err(|e| {
            backend_error!("weights format {} does not fit {:?}: {}", format, desc.weights_dims, e)
        })
    }

    fn activation_descs(&self, desc: &OperationDescriptor) -> ForgeResult<(MemoryDesc, MemoryDesc)> {
        if !desc.layout.is_activation() || desc.layout.rank() != Some(desc.src_dims.len()) {
            return Err(backend_error!(
                "activation layout {} is not supported for rank {}",
                desc.layout,
                desc.src_dims.len()
            ));
        }
        Ok((
            MemoryDesc::new(desc.src_dims.clone(), DType::F32, desc.layout)?,
            MemoryDesc::new(desc.dst_dims.clone(), DType::F32, desc.layout)?,
        ))
    }

    fn bias_desc(&self, desc: &OperationDescriptor) -> ForgeResult<Option<MemoryDesc>> {
        if !desc.has_bias() {
            return Ok(None);
        }
        if desc.bias_dims != [desc.out_channels()] {
            return Err(backend_error!(
                "bias dims {:?} do not match {} output channels",
                desc.bias_dims,
                desc.out_channels()
            ));
        }
        MemoryDesc::new(desc.bias_dims.clone(), DType::F32, FormatTag::X).map(Some)
    }

    fn reject_gradient_extras(&self, desc: &OperationDescriptor) -> ForgeResult<()> {
        if desc.has_bias() || !desc.post_ops.is_empty() {
            return Err(backend_error!(
                "{} does not take bias or post-ops",
                desc.kind.name()
            ));
        }
        Ok(())
    }

    fn conv_forward(&self, desc: &OperationDescriptor) -> ForgeResult<(ArgDescs, Box<dyn PrimitiveKernel>)> {
        let (src, dst) = self.activation_descs(desc)?;
        let weights = self.weights_desc(desc)?;
        let bias = self.bias_desc(desc)?;
        let geometry = ConvGeometry::from_descriptor(desc)?;
        let kernel = ConvForwardKernel {
            src: ActIndex::new(&src)?,
            weights: WeightIndex::new(&weights, geometry.groups)?,
            dst: ActIndex::new(&dst)?,
            post_ops: PostOpChain::compile(&desc.post_ops, geometry.out_channels)?,
            has_bias: bias.is_some(),
            parallel: self.parallel,
            geometry,
        };
        let descs = ArgDescs {
            src: Some(src),
            weights: Some(weights),
            bias,
            diff_dst: None,
            dst,
        };
        Ok((descs, Box::new(kernel)))
    }

    fn conv_backward_data(&self, desc: &OperationDescriptor) -> ForgeResult<(ArgDescs, Box<dyn PrimitiveKernel>)> {
        self.reject_gradient_extras(desc)?;
        let (src, dst) = self.activation_descs(desc)?;
        let weights = self.weights_desc(desc)?;
        let geometry = ConvGeometry::from_descriptor(desc)?;
        let kernel = ConvBackwardDataKernel {
            diff_dst: ActIndex::new(&dst)?,
            weights: WeightIndex::new(&weights, geometry.groups)?,
            diff_src: ActIndex::new(&src)?,
            parallel: self.parallel,
            geometry,
        };
        let descs = ArgDescs {
            src: None,
            weights: Some(weights),
            bias: None,
            diff_dst: Some(dst),
            dst: src,
        };
        Ok((descs, Box::new(kernel)))
    }

    fn conv_backward_weights(&self, desc: &OperationDescriptor) -> ForgeResult<(ArgDescs, Box<dyn PrimitiveKernel>)> {
        self.reject_gradient_extras(desc)?;
        let (src, dst) = self.activation_descs(desc)?;
        let weights = self.weights_desc(desc)?;
        let geometry = ConvGeometry::from_descriptor(desc)?;
        let kernel = ConvBackwardWeightsKernel {
            src: ActIndex::new(&src)?,
            diff_dst: ActIndex::new(&dst)?,
            diff_weights: WeightIndex::new(&weights, geometry.groups)?,
            weights_count: weights.element_count(),
            geometry,
        };
        let descs = ArgDescs {
            src: Some(src),
            weights: None,
            bias: None,
            diff_dst: Some(dst),
            dst: weights,
        };
        Ok((descs, Box::new(kernel)))
    }

    /// Source and destination matrices; dims were cross-checked by `validate`
    fn matrix_descs(&self, desc: &OperationDescriptor) -> ForgeResult<(MemoryDesc, MemoryDesc)> {
        if desc.layout != FormatTag::Nc {
            return Err(backend_error!("{} needs nc activations, got {}", desc.kind.name(), desc.layout));
        }
        Ok((
            MemoryDesc::new(desc.src_dims.clone(), DType::F32, FormatTag::Nc)?,
            MemoryDesc::new(desc.dst_dims.clone(), DType::F32, FormatTag::Nc)?,
        ))
    }

    fn matrix_weights_desc(&self, desc: &OperationDescriptor) -> ForgeResult<MemoryDesc> {
        let weights = self.weights_desc(desc)?;
        if !matches!(weights.format(), FormatTag::Oi | FormatTag::Io) {
            return Err(backend_error!("{} weights cannot use {}", desc.kind.name(), weights.format()));
        }
        Ok(weights)
    }

    fn inner_product(&self, desc: &OperationDescriptor) -> ForgeResult<(ArgDescs, Box<dyn PrimitiveKernel>)> {
        let (src, dst) = self.matrix_descs(desc)?;
        let weights = self.matrix_weights_desc(desc)?;
        let (batch, k) = (desc.src_dims[0], desc.src_dims[1]);
        let channels = desc.dst_dims[1];
        let bias = self.bias_desc(desc)?;
        let src_strides = src.strides()?;
        let weights_strides = weights.strides()?;
        let kernel = InnerProductKernel {
            batch,
            channels,
            k,
            src_strides: [src_strides[0], src_strides[1]],
            weights_strides: [weights_strides[0], weights_strides[1]],
            post_ops: PostOpChain::compile(&desc.post_ops, channels)?,
            has_bias: bias.is_some(),
            parallel: self.parallel,
        };
        let descs = ArgDescs {
            src: Some(src),
            weights: Some(weights),
            bias,
            diff_dst: None,
            dst,
        };
        Ok((descs, Box::new(kernel)))
    }

    fn inner_product_backward_weights(
        &self,
        desc: &OperationDescriptor,
    ) -> ForgeResult<(ArgDescs, Box<dyn PrimitiveKernel>)> {
        self.reject_gradient_extras(desc)?;
        let (src, diff_dst) = self.matrix_descs(desc)?;
        let diff_weights = self.matrix_weights_desc(desc)?;
        let src_strides = src.strides()?;
        let diff_dst_strides = diff_dst.strides()?;
        let weights_strides = diff_weights.strides()?;
        let kernel = InnerProductBackwardWeightsKernel {
            batch: desc.src_dims[0],
            channels: desc.dst_dims[1],
            k: desc.src_dims[1],
            src_strides: [src_strides[0], src_strides[1]],
            diff_dst_strides: [diff_dst_strides[0], diff_dst_strides[1]],
            diff_weights_strides: [weights_strides[0], weights_strides[1]],
            parallel: self.parallel,
        };
        let descs = ArgDescs {
            src: Some(src),
            weights: None,
            bias: None,
            diff_dst: Some(diff_dst),
            dst: diff_weights,
        };
        Ok((descs, Box::new(kernel)))
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_primitive(&self, descriptor: &OperationDescriptor) -> ForgeResult<Primitive> {
        descriptor.validate()?;
        if !descriptor.dtypes.is_uniform(DType::F32) {
            return Err(backend_error!(
                "data type signature {} is not supported by the cpu backend",
                descriptor.dtypes
            ));
        }

        let (descs, kernel) = match descriptor.kind {
            OpKind::ConvForward => self.conv_forward(descriptor)?,
            OpKind::ConvBackwardData => self.conv_backward_data(descriptor)?,
            OpKind::ConvBackwardWeights => self.conv_backward_weights(descriptor)?,
            OpKind::InnerProduct => self.inner_product(descriptor)?,
            OpKind::InnerProductBackwardWeights => self.inner_product_backward_weights(descriptor)?,
        };
        debug!(
            kind = descriptor.kind.name(),
            weights = ?descs.weights.as_ref().map(MemoryDesc::format),
            post_ops = descriptor.post_ops.len(),
            "cpu primitive created"
        );
        Ok(Primitive::new(descriptor.clone(), descs, kernel))
    }
}
