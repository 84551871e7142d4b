//! Convolution gradient entry points: `Conv2DBackpropInput` and
//! `Conv2DBackpropFilter`.
//!
//! The runtime sizes tensor is validated before anything else, and an empty
//! result or empty `out_backprop` returns a zero-filled tensor of the
//! declared shape without touching the other buffers.

use super::{element_type, prepare_weights, report};
use crate::config_error;
use crate::conv::{ConvAttrs, ConvShapes};
use crate::descriptor::{DTypeSignature, OpKind};
use crate::engine::Engine;
use crate::error::{checked_element_count, ForgeError, ForgeResult};
use crate::framework::{AttrMap, OpKernelContext, Tensor};
use crate::memory::DType;
use crate::primitive::ExecArgs;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Which gradient the kernel produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpropKind {
    /// Inputs `input_sizes, filter, out_backprop`
    Input,
    /// Inputs `input, filter_sizes, out_backprop`
    Filter,
}

impl BackpropKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Conv2DBackpropInput" => Some(BackpropKind::Input),
            "Conv2DBackpropFilter" => Some(BackpropKind::Filter),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackpropKind::Input => "Conv2DBackpropInput",
            BackpropKind::Filter => "Conv2DBackpropFilter",
        }
    }

    fn sizes_index(&self) -> usize {
        match self {
            BackpropKind::Input => 0,
            BackpropKind::Filter => 1,
        }
    }

    fn op_kind(&self) -> OpKind {
        match self {
            BackpropKind::Input => OpKind::ConvBackwardData,
            BackpropKind::Filter => OpKind::ConvBackwardWeights,
        }
    }
}

#[derive(Debug)]
pub struct ConvBackpropKernel {
    kind: BackpropKind,
    attrs: ConvAttrs,
    element_type: DType,
    engine: Arc<Engine>,
}

impl ConvBackpropKernel {
    pub fn configure(kind: BackpropKind, attrs: &AttrMap) -> ForgeResult<Self> {
        Self::configure_with_engine(kind, attrs, Engine::global())
    }

    pub fn configure_with_engine(kind: BackpropKind, attrs: &AttrMap, engine: Arc<Engine>) -> ForgeResult<Self> {
        let conv_attrs = ConvAttrs::from_attrs(attrs)?;
        if conv_attrs.rank() != 4 {
            return Err(config_error!("{} takes 4-D strides", kind.name()));
        }
        info!(op = kind.name(), format = %conv_attrs.format, "gradient kernel configured");
        Ok(Self {
            kind,
            attrs: conv_attrs,
            element_type: element_type(attrs)?,
            engine,
        })
    }

    pub fn kind(&self) -> BackpropKind {
        self.kind
    }

    pub fn compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) {
        let result = self.try_compute(ctx);
        report(ctx, self.kind.name(), result);
    }

    pub fn try_compute<C: OpKernelContext + ?Sized>(&self, ctx: &mut C) -> ForgeResult<()> {
        let sizes = read_sizes(ctx.input(self.kind.sizes_index())?)?;
        let operand = match self.kind {
            BackpropKind::Input => ctx.input(1)?.clone(),
            BackpropKind::Filter => ctx.input(0)?.clone(),
        };
        let out_backprop = ctx.input(2)?.clone();

        let result_count = checked_element_count("gradient sizes", &sizes)?;
        if result_count == 0 || out_backprop.num_elements() == 0 || operand.num_elements() == 0 {
            debug!(op = self.kind.name(), shape = ?sizes, "empty gradient, skipping execution");
            return ctx.allocate_output(0, &sizes);
        }

        let (src_shape, filter_shape) = match self.kind {
            BackpropKind::Input => (sizes.as_slice(), operand.shape()),
            BackpropKind::Filter => (operand.shape(), sizes.as_slice()),
        };
        let shapes = ConvShapes::resolve(
            &self.attrs,
            false,
            src_shape,
            filter_shape,
            self.attrs.explicit_pads.as_ref(),
        )?;
        if out_backprop.shape() != shapes.dst_shape.as_slice() {
            return Err(ForgeError::ShapeMismatch(format!(
                "out_backprop {:?} does not match the forward output {:?}",
                out_backprop.shape(),
                shapes.dst_shape
            )));
        }

        // gradients are produced directly in the user filter layout
        let descriptor = shapes.descriptor(
            &self.attrs,
            self.kind.op_kind(),
            Vec::new(),
            shapes.filter_format,
            DTypeSignature::uniform(self.element_type, false),
            Vec::new(),
        );
        let primitive = self.engine.primitive(&descriptor)?;
        let diff_dst = out_backprop.as_f32()?;

        ctx.allocate_output(0, &sizes)?;
        match self.kind {
            BackpropKind::Input => {
                let weights = prepare_weights(
                    self.engine.backend(),
                    None,
                    operand.as_f32()?,
                    &shapes.filter_desc(self.element_type)?,
                    primitive.weights_desc(),
                )?;
                let dst = ctx.output_mut(0)?.as_f32_mut()?;
                primitive.execute(&ExecArgs::backward_data(diff_dst, &weights), dst)?;
            }
            BackpropKind::Filter => {
                let dst = ctx.output_mut(0)?.as_f32_mut()?;
                primitive.execute(&ExecArgs::backward_weights(operand.as_f32()?, diff_dst), dst)?;
            }
        }
        trace!(op = self.kind.name(), shape = ?sizes, "gradient done");
        Ok(())
    }
}

/// 1-D int32 tensor of exactly four non-negative sizes
fn read_sizes(tensor: &Tensor) -> ForgeResult<Vec<usize>> {
    if tensor.rank() != 1 {
        return Err(ForgeError::ShapeMismatch(format!(
            "sizes must be a 1-D vector, got shape {:?}",
            tensor.shape()
        )));
    }
    let values = tensor
        .as_i32()
        .map_err(|_| ForgeError::ShapeMismatch("sizes must be an int32 vector".to_string()))?;
    if values.len() != 4 {
        return Err(ForgeError::ShapeMismatch(format!(
            "sizes must have 4 elements, got {}",
            values.len()
        )));
    }
    values
        .iter()
        .map(|&v| {
            usize::try_from(v)
                .map_err(|_| ForgeError::ShapeMismatch(format!("sizes must be non-negative, got {}", v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ForgeConfig;
    use crate::framework::HostContext;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(ForgeConfig::new()))
    }

    fn attrs() -> AttrMap {
        AttrMap::new()
            .with("strides", vec![1i64, 1, 1, 1])
            .with("padding", "VALID")
            .with("data_format", "NHWC")
    }

    fn tensor(shape: &[usize], values: &[f32]) -> Tensor {
        Tensor::from_f32(shape.to_vec(), values.to_vec()).unwrap()
    }

    #[test]
    fn test_backprop_input_1x1() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &attrs(), engine()).unwrap();
        let mut ctx = HostContext::new(vec![
            Tensor::vector_i32(&[1, 2, 2, 1]),
            tensor(&[1, 1, 1, 1], &[3.0]),
            tensor(&[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0]),
        ]);
        kernel.compute(&mut ctx);
        assert!(ctx.is_ok(), "{:?}", ctx.status());
        let out = ctx.output(0).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        assert_eq!(out.as_f32().unwrap(), &[3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_backprop_filter_1x1() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &attrs(), engine()).unwrap();
        let mut ctx = HostContext::new(vec![
            tensor(&[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0]),
            Tensor::vector_i32(&[1, 1, 1, 1]),
            tensor(&[1, 2, 2, 1], &[1.0, 1.0, 1.0, 1.0]),
        ]);
        kernel.compute(&mut ctx);
        assert!(ctx.is_ok(), "{:?}", ctx.status());
        assert_eq!(ctx.output(0).unwrap().as_f32().unwrap(), &[10.0]);
    }

    #[test]
    fn test_zero_sized_gradient_short_circuits() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &attrs(), engine()).unwrap();
        let mut ctx = HostContext::new(vec![
            tensor(&[1, 1, 1, 1], &[1.0]),
            Tensor::vector_i32(&[0, 0, 0, 0]),
            tensor(&[1, 1, 1, 1], &[1.0]),
        ]);
        kernel.compute(&mut ctx);
        assert!(ctx.is_ok(), "{:?}", ctx.status());
        let out = ctx.output(0).unwrap();
        assert_eq!(out.shape(), &[0, 0, 0, 0]);
        assert_eq!(out.num_elements(), 0);
    }

    #[test]
    fn test_overflowing_sizes_rejected_before_allocation() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &attrs(), engine()).unwrap();
        let max = i32::MAX;
        let mut ctx = HostContext::new(vec![
            Tensor::vector_i32(&[max, max, max, max]),
            tensor(&[1, 1, 1, 1], &[1.0]),
            tensor(&[0, 0, 0, 0], &[]),
        ]);
        kernel.compute(&mut ctx);
        assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))));
        assert!(ctx.output(0).is_none());
    }

    #[test]
    fn test_sizes_validation() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &attrs(), engine()).unwrap();
        for sizes in [
            Tensor::vector_i32(&[1, 1, 1]),
            Tensor::vector_i32(&[1, 1, -1, 1]),
            Tensor::from_i32(vec![2, 2], vec![1, 1, 1, 1]).unwrap(),
            tensor(&[4], &[1.0; 4]),
        ] {
            let mut ctx = HostContext::new(vec![
                tensor(&[1, 2, 2, 1], &[1.0; 4]),
                sizes,
                tensor(&[1, 2, 2, 1], &[1.0; 4]),
            ]);
            kernel.compute(&mut ctx);
            assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))));
        }
    }

    #[test]
    fn test_out_backprop_shape_checked() {
        let kernel = ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &attrs(), engine()).unwrap();
        let mut ctx = HostContext::new(vec![
            Tensor::vector_i32(&[1, 3, 3, 1]),
            tensor(&[2, 2, 1, 1], &[1.0; 4]),
            tensor(&[1, 3, 3, 1], &[1.0; 9]),
        ]);
        kernel.compute(&mut ctx);
        assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))));
    }

    #[test]
    fn test_rank_must_be_4() {
        let attrs = AttrMap::new()
            .with("strides", vec![1i64, 1, 1, 1, 1])
            .with("padding", "VALID");
        let err = ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &attrs, engine()).unwrap_err();
        assert!(matches!(err, ForgeError::InvalidConfiguration(_)));
    }
}
