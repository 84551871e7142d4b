//! Stride-based addressing shared by the CPU convolution kernels.
//!
//! 2-D problems are lifted to 3-D with a unit depth so every kernel runs the
//! same loop nest.

use crate::descriptor::OperationDescriptor;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::MemoryDesc;

pub(crate) type Spatial = [usize; 3];

fn lift(values: &[usize], fill: usize) -> ForgeResult<Spatial> {
    match values {
        [h, w] => Ok([fill, *h, *w]),
        [d, h, w] => Ok([*d, *h, *w]),
        other => Err(ForgeError::BackendRejected(format!(
            "only 2-D and 3-D convolutions are supported, got {} spatial dims",
            other.len()
        ))),
    }
}

/// Problem sizes of one convolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    pub input: Spatial,
    pub output: Spatial,
    pub kernel: Spatial,
    pub strides: Spatial,
    pub dilations: Spatial,
    pub pad_before: Spatial,
}

impl ConvGeometry {
    pub(crate) fn from_descriptor(desc: &OperationDescriptor) -> ForgeResult<Self> {
        let weights_spatial = if desc.groups > 1 {
            &desc.weights_dims[3..]
        } else {
            &desc.weights_dims[2..]
        };
        let geometry = Self {
            batch: desc.src_dims[0],
            in_channels: desc.src_dims[1],
            out_channels: desc.dst_dims[1],
            groups: desc.groups,
            input: lift(&desc.src_dims[2..], 1)?,
            output: lift(&desc.dst_dims[2..], 1)?,
            kernel: lift(weights_spatial, 1)?,
            strides: lift(&desc.strides, 1)?,
            dilations: lift(&desc.dilations, 1)?,
            pad_before: lift(&desc.padding_left, 0)?,
        };
        if geometry.in_channels % geometry.groups != 0 || geometry.out_channels % geometry.groups != 0 {
            return Err(ForgeError::BackendRejected(format!(
                "{} groups do not divide {} input / {} output channels",
                geometry.groups, geometry.in_channels, geometry.out_channels
            )));
        }
        Ok(geometry)
    }

    pub(crate) fn in_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub(crate) fn out_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    pub(crate) fn dst_per_batch(&self) -> usize {
        self.out_channels * self.output.iter().product::<usize>()
    }

    pub(crate) fn src_per_batch(&self) -> usize {
        self.in_channels * self.input.iter().product::<usize>()
    }

    /// Input coordinate read by output `out` through kernel tap `k`
    #[inline]
    pub(crate) fn input_coord(&self, axis: usize, out: usize, k: usize) -> Option<usize> {
        let pos = out * self.strides[axis] + k * self.dilations[axis];
        let pad = self.pad_before[axis];
        if pos < pad {
            return None;
        }
        let pos = pos - pad;
        (pos < self.input[axis]).then_some(pos)
    }
}

/// Strides of an activation buffer: `[N, C, spatial..]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActIndex {
    pub n: usize,
    pub c: usize,
    pub spatial: Spatial,
}

impl ActIndex {
    pub(crate) fn new(desc: &MemoryDesc) -> ForgeResult<Self> {
        let strides = desc.strides()?;
        Ok(Self {
            n: strides[0],
            c: strides[1],
            spatial: lift(&strides[2..], 0)?,
        })
    }

    /// Offset within one batch item
    #[inline]
    pub(crate) fn offset(&self, c: usize, pos: Spatial) -> usize {
        c * self.c + pos[0] * self.spatial[0] + pos[1] * self.spatial[1] + pos[2] * self.spatial[2]
    }
}

/// Strides of a weights buffer, grouped or not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WeightIndex {
    pub group: usize,
    pub out: usize,
    pub inp: usize,
    pub spatial: Spatial,
}

impl WeightIndex {
    pub(crate) fn new(desc: &MemoryDesc, groups: usize) -> ForgeResult<Self> {
        let s = desc.strides()?;
        if groups > 1 {
            Ok(Self {
                group: s[0],
                out: s[1],
                inp: s[2],
                spatial: lift(&s[3..], 0)?,
            })
        } else {
            Ok(Self {
                group: 0,
                out: s[0],
                inp: s[1],
                spatial: lift(&s[2..], 0)?,
            })
        }
    }

    #[inline]
    pub(crate) fn offset(&self, g: usize, oc: usize, ic: usize, k: Spatial) -> usize {
        g * self.group
            + oc * self.out
            + ic * self.inp
            + k[0] * self.spatial[0]
            + k[1] * self.spatial[1]
            + k[2] * self.spatial[2]
    }
}
