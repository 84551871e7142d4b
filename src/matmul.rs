//! Descriptor builders for fused matrix multiplication and its gradient.
//!
//! `src [batch, k] x weights [k, channel]` (or `[channel, k]` when
//! `transpose_b`) plus `bias [channel]`, lowered to an inner-product
//! primitive. The gradient lowers to an inner-product backward-weights
//! primitive over the same dims.

use crate::descriptor::{DTypeSignature, OpKind, OperationDescriptor, PostOp};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::{DType, FormatTag, MemoryDesc};

/// Runtime inputs of one matmul call
#[derive(Debug, Clone, Copy)]
pub struct MatMulRequest<'a> {
    pub transpose_b: bool,
    /// Constant weights let the backend choose their layout
    pub weights_const: bool,
    pub src_shape: &'a [usize],
    pub weights_shape: &'a [usize],
    pub bias_shape: &'a [usize],
    pub post_ops: &'a [PostOp],
    pub element_type: DType,
}

#[derive(Debug, Clone)]
pub struct MatMulPlan {
    pub descriptor: OperationDescriptor,
    pub dst_shape: Vec<usize>,
    pub src_desc: MemoryDesc,
    /// Weights as the user supplies them, logical `[channel, k]`
    pub weights_desc: MemoryDesc,
}

#[derive(Debug, Clone)]
pub enum MatMulOutcome {
    Empty { dst_shape: Vec<usize> },
    Compute(MatMulPlan),
}

pub fn plan_matmul(request: &MatMulRequest<'_>) -> ForgeResult<MatMulOutcome> {
    let src = request.src_shape;
    let weights = request.weights_shape;
    if src.len() != 2 {
        return Err(ForgeError::ShapeMismatch(format!("In[0] is not a matrix: {:?}", src)));
    }
    if weights.len() != 2 {
        return Err(ForgeError::ShapeMismatch(format!(
            "In[1] is not a matrix: {:?}",
            weights
        )));
    }
    if request.bias_shape.len() != 1 {
        return Err(ForgeError::ShapeMismatch(format!(
            "Biases must be 1D: {:?}",
            request.bias_shape
        )));
    }

    let (batch, k) = (src[0], src[1]);
    let (weights_k, channel) = if request.transpose_b {
        (weights[1], weights[0])
    } else {
        (weights[0], weights[1])
    };
    if k != weights_k {
        return Err(ForgeError::ShapeMismatch(format!(
            "Matrix size-incompatible: In[0]: {:?}, In[1]: {:?}",
            src, weights
        )));
    }
    if request.bias_shape[0] != channel {
        return Err(ForgeError::ShapeMismatch(format!(
            "bias has {} entries for {} output channels",
            request.bias_shape[0], channel
        )));
    }

    let dst_shape = vec![batch, channel];
    if batch == 0 || channel == 0 {
        return Ok(MatMulOutcome::Empty { dst_shape });
    }

    let dtype = request.element_type;
    let user_format = if request.transpose_b {
        FormatTag::Oi
    } else {
        FormatTag::Io
    };
    let descriptor = OperationDescriptor {
        kind: OpKind::InnerProduct,
        src_dims: vec![batch, k],
        weights_dims: vec![channel, k],
        bias_dims: vec![channel],
        dst_dims: dst_shape.clone(),
        strides: Vec::new(),
        dilations: Vec::new(),
        padding_left: Vec::new(),
        padding_right: Vec::new(),
        groups: 1,
        layout: FormatTag::Nc,
        weights_format: if request.weights_const {
            FormatTag::Any
        } else {
            user_format
        },
        dtypes: DTypeSignature::uniform(dtype, true),
        post_ops: request.post_ops.to_vec(),
    };

    Ok(MatMulOutcome::Compute(MatMulPlan {
        src_desc: MemoryDesc::new(vec![batch, k], dtype, FormatTag::Nc)?,
        weights_desc: MemoryDesc::new(vec![channel, k], dtype, user_format)?,
        dst_shape,
        descriptor,
    }))
}

/// Runtime inputs of one matmul-gradient call
#[derive(Debug, Clone, Copy)]
pub struct MatMulGradRequest<'a> {
    pub transpose_a: bool,
    pub transpose_b: bool,
    /// `[batch, k]`, or `[k, batch]` when `transpose_a`
    pub src_shape: &'a [usize],
    /// `[batch, channel]`
    pub diff_dst_shape: &'a [usize],
    pub element_type: DType,
}

#[derive(Debug, Clone)]
pub struct MatMulGradPlan {
    pub descriptor: OperationDescriptor,
    /// `[k, channel]`, or `[channel, k]` when `transpose_b`
    pub diff_weights_shape: Vec<usize>,
    pub diff_bias_shape: Vec<usize>,
    /// Source as the user supplies it, logical `[batch, k]`
    pub src_desc: MemoryDesc,
}

#[derive(Debug, Clone)]
pub enum MatMulGradOutcome {
    /// Zero batch or zero channels: both gradients are zero-filled
    Empty {
        diff_weights_shape: Vec<usize>,
        diff_bias_shape: Vec<usize>,
    },
    Compute(MatMulGradPlan),
}

pub fn plan_matmul_grad(request: &MatMulGradRequest<'_>) -> ForgeResult<MatMulGradOutcome> {
    let src = request.src_shape;
    let diff_dst = request.diff_dst_shape;
    if src.len() != 2 {
        return Err(ForgeError::ShapeMismatch(format!("In[0] is not a matrix: {:?}", src)));
    }
    if diff_dst.len() != 2 {
        return Err(ForgeError::ShapeMismatch(format!(
            "In[1] is not a matrix: {:?}",
            diff_dst
        )));
    }

    let (batch, k) = if request.transpose_a {
        (src[1], src[0])
    } else {
        (src[0], src[1])
    };
    let channel = diff_dst[1];
    if batch != diff_dst[0] {
        return Err(ForgeError::ShapeMismatch(format!(
            "Matrix size-incompatible: In[0]: {:?}, In[1]: {:?}",
            src, diff_dst
        )));
    }

    let (diff_weights_shape, weights_format) = if request.transpose_b {
        (vec![channel, k], FormatTag::Oi)
    } else {
        (vec![k, channel], FormatTag::Io)
    };
    let diff_bias_shape = vec![channel];
    if batch == 0 || channel == 0 {
        return Ok(MatMulGradOutcome::Empty {
            diff_weights_shape,
            diff_bias_shape,
        });
    }

    let dtype = request.element_type;
    let src_format = if request.transpose_a {
        FormatTag::Cn
    } else {
        FormatTag::Nc
    };
    // the gradient is produced directly in the user weights layout
    let descriptor = OperationDescriptor {
        kind: OpKind::InnerProductBackwardWeights,
        src_dims: vec![batch, k],
        weights_dims: vec![channel, k],
        bias_dims: Vec::new(),
        dst_dims: vec![batch, channel],
        strides: Vec::new(),
        dilations: Vec::new(),
        padding_left: Vec::new(),
        padding_right: Vec::new(),
        groups: 1,
        layout: FormatTag::Nc,
        weights_format,
        dtypes: DTypeSignature::uniform(dtype, false),
        post_ops: Vec::new(),
    };

    Ok(MatMulGradOutcome::Compute(MatMulGradPlan {
        src_desc: MemoryDesc::new(vec![batch, k], dtype, src_format)?,
        diff_weights_shape,
        diff_bias_shape,
        descriptor,
    }))
}
