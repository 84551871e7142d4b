//! Descriptor builder for the convolution family.
//!
//! Turns validated attributes plus runtime tensor shapes into canonical
//! logical dims, output sizes and an [`OperationDescriptor`].

use super::layout::PadAmounts;
use super::validate::{ConvAttrs, Padding};
use crate::descriptor::{DTypeSignature, OpKind, OperationDescriptor, PostOp};
use crate::error::{checked_element_count, ForgeError, ForgeResult};
use crate::memory::{DType, FormatTag, MemoryDesc};

/// Output size and applied pads of one spatial dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialExtent {
    pub output: usize,
    pub pad_before: usize,
    pub pad_after: usize,
}

/// How pads of one dimension are determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadSpec {
    Same,
    Valid,
    Explicit { before: usize, after: usize },
}

/// Output size of one windowed dimension.
///
/// Effective filter size is `(k - 1) * d + 1`. Arithmetic is signed so that
/// an input smaller than the window is reported instead of wrapping, and
/// checked so that huge attributes are reported instead of overflowing.
pub fn windowed_output_size(
    input: usize,
    filter: usize,
    dilation: usize,
    stride: usize,
    pad: PadSpec,
) -> ForgeResult<SpatialExtent> {
    if filter == 0 || dilation == 0 || stride == 0 {
        return Err(ForgeError::ShapeMismatch(format!(
            "window needs positive filter, dilation and stride, got {}, {}, {}",
            filter, dilation, stride
        )));
    }
    let input_i = signed(input)?;
    let stride_i = signed(stride)?;
    let effective = (signed(filter)? - 1)
        .checked_mul(signed(dilation)?)
        .and_then(|v| v.checked_add(1))
        .ok_or_else(|| window_overflow(input, filter, dilation, stride))?;

    match pad {
        PadSpec::Same => {
            let output = if input_i == 0 { 0 } else { (input_i - 1) / stride_i + 1 };
            let needed = (output - 1)
                .checked_mul(stride_i)
                .and_then(|v| v.checked_add(effective))
                .map(|v| (v - input_i).max(0))
                .ok_or_else(|| window_overflow(input, filter, dilation, stride))?;
            let before = needed / 2;
            Ok(SpatialExtent {
                output: output as usize,
                pad_before: before as usize,
                pad_after: (needed - before) as usize,
            })
        }
        PadSpec::Valid => {
            let output = strided_count(input_i - effective, stride_i)
                .ok_or_else(|| negative_output(input, effective))?;
            Ok(SpatialExtent {
                output,
                pad_before: 0,
                pad_after: 0,
            })
        }
        PadSpec::Explicit { before, after } => {
            let padded = input_i
                .checked_add(signed(before)?)
                .and_then(|v| v.checked_add(signed(after).ok()?))
                .ok_or_else(|| {
                    ForgeError::ShapeMismatch(format!(
                        "padded input {} + {} + {} overflows the window arithmetic",
                        input, before, after
                    ))
                })?;
            let output = strided_count(padded - effective, stride_i)
                .ok_or_else(|| negative_output(input, effective))?;
            Ok(SpatialExtent {
                output,
                pad_before: before,
                pad_after: after,
            })
        }
    }
}

/// `floor((slack + stride) / stride)` without forming the sum; `None` when
/// the window overhangs the input by more than one stride
fn strided_count(slack: i64, stride: i64) -> Option<usize> {
    if slack >= 0 {
        Some((slack / stride + 1) as usize)
    } else if slack >= -stride {
        Some(0)
    } else {
        None
    }
}

fn signed(value: usize) -> ForgeResult<i64> {
    i64::try_from(value).map_err(|_| {
        ForgeError::ShapeMismatch(format!("window parameter {} does not fit in i64", value))
    })
}

fn window_overflow(input: usize, filter: usize, dilation: usize, stride: usize) -> ForgeError {
    ForgeError::ShapeMismatch(format!(
        "window of filter {} dilation {} stride {} over input {} overflows",
        filter, dilation, stride, input
    ))
}

fn negative_output(input: usize, effective: i64) -> ForgeError {
    ForgeError::ShapeMismatch(format!(
        "Computed output size would be negative: input {} smaller than window {}",
        input, effective
    ))
}

/// Forward geometry resolved from attributes and runtime shapes
#[derive(Debug, Clone, PartialEq)]
pub struct ConvShapes {
    /// `[N, C, spatial..]`
    pub src_dims: Vec<usize>,
    /// `[O, I, spatial..]`, or `[G, O/G, I/G, spatial..]` for depthwise
    /// over more than one channel
    pub weights_dims: Vec<usize>,
    /// `[N, OC, spatial..]`
    pub dst_dims: Vec<usize>,
    /// Destination shape in the user layout
    pub dst_shape: Vec<usize>,
    pub groups: usize,
    pub padding_left: Vec<usize>,
    pub padding_right: Vec<usize>,
    /// User memory formats of activations and filter
    pub layout: FormatTag,
    pub filter_format: FormatTag,
}

impl ConvShapes {
    /// Resolve the forward geometry.
    ///
    /// The filter is `[spatial.., in, out]`, or `[kh, kw, in, multiplier]`
    /// for depthwise. `pads` overrides the padding mode when present.
    pub fn resolve(
        attrs: &ConvAttrs,
        depthwise: bool,
        src_shape: &[usize],
        filter_shape: &[usize],
        pads: Option<&PadAmounts>,
    ) -> ForgeResult<Self> {
        let format = attrs.format;
        let rank = format.rank();
        let spatial = format.spatial_rank();
        if src_shape.len() != rank {
            return Err(ForgeError::ShapeMismatch(format!(
                "input must be {}-dimensional: {:?}",
                rank, src_shape
            )));
        }
        if filter_shape.len() != rank {
            return Err(ForgeError::ShapeMismatch(format!(
                "filter must be {}-dimensional: {:?}",
                rank, filter_shape
            )));
        }

        let src_dims = format.to_logical(src_shape);
        let (batch, channels) = (src_dims[0], src_dims[1]);
        let kernel = &filter_shape[..spatial];
        let filter_in = filter_shape[spatial];
        let filter_out = filter_shape[spatial + 1];
        if filter_in != channels {
            return Err(ForgeError::ShapeMismatch(format!(
                "input and filter must have the same depth: {} vs {}",
                channels, filter_in
            )));
        }

        let mut out_spatial = Vec::with_capacity(spatial);
        let mut padding_left = Vec::with_capacity(spatial);
        let mut padding_right = Vec::with_capacity(spatial);
        for i in 0..spatial {
            let pad = match pads {
                Some(p) => PadSpec::Explicit {
                    before: p.before[i],
                    after: p.after[i],
                },
                None => match attrs.padding {
                    Padding::Same => PadSpec::Same,
                    Padding::Valid => PadSpec::Valid,
                    Padding::Explicit => {
                        return Err(ForgeError::Internal(
                            "EXPLICIT padding resolved without pad amounts".to_string(),
                        ))
                    }
                },
            };
            let extent = windowed_output_size(
                src_dims[2 + i],
                kernel[i],
                attrs.dilations[i],
                attrs.strides[i],
                pad,
            )?;
            out_spatial.push(extent.output);
            padding_left.push(extent.pad_before);
            padding_right.push(extent.pad_after);
        }

        // a depthwise filter over one channel is a plain convolution
        let grouped = depthwise && channels > 1;
        let out_channels = if depthwise {
            channels.checked_mul(filter_out).ok_or_else(|| {
                ForgeError::ShapeMismatch(format!(
                    "{} channels times multiplier {} overflows",
                    channels, filter_out
                ))
            })?
        } else {
            filter_out
        };
        let (groups, weights_dims) = if grouped {
            let mut dims = vec![channels, filter_out, 1];
            dims.extend_from_slice(kernel);
            (channels, dims)
        } else {
            let mut dims = vec![out_channels, channels];
            dims.extend_from_slice(kernel);
            (1, dims)
        };

        let mut dst_dims = vec![batch, out_channels];
        dst_dims.extend_from_slice(&out_spatial);
        checked_element_count("convolution output", &dst_dims)?;
        let dst_shape = format.from_logical(&dst_dims);

        Ok(Self {
            src_dims,
            weights_dims,
            dst_dims,
            dst_shape,
            groups,
            padding_left,
            padding_right,
            layout: format.format_tag(),
            filter_format: format.filter_format(grouped),
        })
    }

    pub fn out_channels(&self) -> usize {
        self.dst_dims[1]
    }

    /// Zero output elements or zero batch: nothing to compute
    pub fn is_empty(&self) -> bool {
        self.dst_dims.iter().product::<usize>() == 0
    }

    pub fn src_desc(&self, dtype: DType) -> ForgeResult<MemoryDesc> {
        MemoryDesc::new(self.src_dims.clone(), dtype, self.layout)
    }

    pub fn dst_desc(&self, dtype: DType) -> ForgeResult<MemoryDesc> {
        MemoryDesc::new(self.dst_dims.clone(), dtype, self.layout)
    }

    /// The filter as the user supplies it
    pub fn filter_desc(&self, dtype: DType) -> ForgeResult<MemoryDesc> {
        MemoryDesc::new(self.weights_dims.clone(), dtype, self.filter_format)
    }

    /// Descriptor of one primitive over this geometry
    pub fn descriptor(
        &self,
        attrs: &ConvAttrs,
        kind: OpKind,
        bias_dims: Vec<usize>,
        weights_format: FormatTag,
        dtypes: DTypeSignature,
        post_ops: Vec<PostOp>,
    ) -> OperationDescriptor {
        OperationDescriptor {
            kind,
            src_dims: self.src_dims.clone(),
            weights_dims: self.weights_dims.clone(),
            bias_dims,
            dst_dims: self.dst_dims.clone(),
            strides: attrs.strides.clone(),
            dilations: attrs.dilations.clone(),
            padding_left: self.padding_left.clone(),
            padding_right: self.padding_right.clone(),
            groups: self.groups,
            layout: self.layout,
            weights_format,
            dtypes,
            post_ops,
        }
    }
}

/// Runtime inputs of a forward convolution
#[derive(Debug, Clone, Copy)]
pub struct ConvForwardRequest<'a> {
    pub attrs: &'a ConvAttrs,
    pub depthwise: bool,
    pub src_shape: &'a [usize],
    pub filter_shape: &'a [usize],
    pub bias_shape: Option<&'a [usize]>,
    pub pads: Option<&'a PadAmounts>,
    pub post_ops: &'a [PostOp],
    pub element_type: DType,
}

/// Everything the executor needs for one forward call
#[derive(Debug, Clone)]
pub struct ConvForwardPlan {
    pub descriptor: OperationDescriptor,
    pub dst_shape: Vec<usize>,
    pub src_desc: MemoryDesc,
    /// User filter layout; the primitive may want another
    pub filter_desc: MemoryDesc,
}

#[derive(Debug, Clone)]
pub enum ConvPlan {
    /// Zero-sized output: allocate it and stop
    Empty { dst_shape: Vec<usize> },
    Compute(ConvForwardPlan),
}

/// Build the forward descriptor, or report a zero-sized output.
///
/// The filter always requests format `Any` so the backend picks its
/// preferred layout and constant filters can be cached in it.
pub fn plan_forward(request: &ConvForwardRequest<'_>) -> ForgeResult<ConvPlan> {
    let shapes = ConvShapes::resolve(
        request.attrs,
        request.depthwise,
        request.src_shape,
        request.filter_shape,
        request.pads,
    )?;

    let bias_dims = match request.bias_shape {
        Some(shape) => {
            if shape.len() != 1 {
                return Err(ForgeError::ShapeMismatch(format!(
                    "Biases must be 1D: {:?}",
                    shape
                )));
            }
            if shape[0] != shapes.out_channels() {
                return Err(ForgeError::ShapeMismatch(format!(
                    "bias has {} entries for {} output channels",
                    shape[0],
                    shapes.out_channels()
                )));
            }
            shape.to_vec()
        }
        None => Vec::new(),
    };

    if shapes.is_empty() {
        return Ok(ConvPlan::Empty {
            dst_shape: shapes.dst_shape,
        });
    }

    let dtype = request.element_type;
    let descriptor = shapes.descriptor(
        request.attrs,
        OpKind::ConvForward,
        bias_dims,
        FormatTag::Any,
        DTypeSignature::uniform(dtype, request.bias_shape.is_some()),
        request.post_ops.to_vec(),
    );
    Ok(ConvPlan::Compute(ConvForwardPlan {
        src_desc: shapes.src_desc(dtype)?,
        filter_desc: shapes.filter_desc(dtype)?,
        dst_shape: shapes.dst_shape,
        descriptor,
    }))
}
