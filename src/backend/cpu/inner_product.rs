//! Inner product: `dst[b, o] = sum_k src[b, k] * w[o, k] + bias[o]`.

use super::post_ops::PostOpChain;
use crate::error::ForgeResult;
use crate::primitive::{ArgRole, ExecArgs, PrimitiveKernel};
use rayon::prelude::*;

#[derive(Debug)]
pub(crate) struct InnerProductKernel {
    pub batch: usize,
    pub channels: usize,
    pub k: usize,
    /// `[batch, k]` strides of the source
    pub src_strides: [usize; 2],
    /// `[channel, k]` strides of the weights
    pub weights_strides: [usize; 2],
    pub post_ops: PostOpChain,
    pub has_bias: bool,
    pub parallel: bool,
}

impl InnerProductKernel {
    fn compute_row(&self, b: usize, src: &[f32], weights: &[f32], bias: Option<&[f32]>, row: &mut [f32]) {
        let src_row = b * self.src_strides[0];
        for (o, out) in row.iter_mut().enumerate() {
            let w_row = o * self.weights_strides[0];
            let mut acc = 0.0f32;
            for i in 0..self.k {
                acc += src[src_row + i * self.src_strides[1]] * weights[w_row + i * self.weights_strides[1]];
            }
            let value = acc + bias.map_or(0.0, |bias| bias[o]);
            *out = self.post_ops.apply(value, o, *out);
        }
    }
}

impl PrimitiveKernel for InnerProductKernel {
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        let src = args.require(ArgRole::Src)?;
        let weights = args.require(ArgRole::Weights)?;
        let bias = if self.has_bias {
            Some(args.require(ArgRole::Bias)?)
        } else {
            None
        };
        if self.batch == 0 || self.channels == 0 {
            return Ok(());
        }

        let dst = &mut dst[..self.batch * self.channels];
        let body = |(b, row): (usize, &mut [f32])| self.compute_row(b, src, weights, bias, row);
        if self.parallel {
            dst.par_chunks_mut(self.channels).enumerate().for_each(body);
        } else {
            dst.chunks_mut(self.channels).enumerate().for_each(body);
        }
        Ok(())
    }
}

/// Weight gradient: `diff_w[o, k] = sum_b diff_dst[b, o] * src[b, k]`
#[derive(Debug)]
pub(crate) struct InnerProductBackwardWeightsKernel {
    pub batch: usize,
    pub channels: usize,
    pub k: usize,
    pub src_strides: [usize; 2],
    pub diff_dst_strides: [usize; 2],
    /// `[channel, k]` strides of the produced gradient
    pub diff_weights_strides: [usize; 2],
    pub parallel: bool,
}

impl InnerProductBackwardWeightsKernel {
    fn compute_row(&self, o: usize, src: &[f32], diff_dst: &[f32], row: &mut [f32]) {
        row.fill(0.0);
        for b in 0..self.batch {
            let g = diff_dst[b * self.diff_dst_strides[0] + o * self.diff_dst_strides[1]];
            let src_row = b * self.src_strides[0];
            for (i, out) in row.iter_mut().enumerate() {
                *out += g * src[src_row + i * self.src_strides[1]];
            }
        }
    }
}

impl PrimitiveKernel for InnerProductBackwardWeightsKernel {
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        let src = args.require(ArgRole::Src)?;
        let diff_dst = args.require(ArgRole::DiffDst)?;
        if self.channels == 0 || self.k == 0 {
            return Ok(());
        }

        // rows are accumulated densely, then placed with the requested strides
        let mut rows = vec![0.0f32; self.channels * self.k];
        let body = |(o, row): (usize, &mut [f32])| self.compute_row(o, src, diff_dst, row);
        if self.parallel {
            rows.par_chunks_mut(self.k).enumerate().for_each(body);
        } else {
            rows.chunks_mut(self.k).enumerate().for_each(body);
        }
        let [row_stride, col_stride] = self.diff_weights_strides;
        for (o, row) in rows.chunks(self.k).enumerate() {
            for (i, &value) in row.iter().enumerate() {
                dst[o * row_stride + i * col_stride] = value;
            }
        }
        Ok(())
    }
}
