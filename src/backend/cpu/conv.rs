//! Direct convolution kernels: forward, backward-data, backward-weights.

use super::geometry::{ActIndex, ConvGeometry, Spatial, WeightIndex};
use super::post_ops::PostOpChain;
use crate::error::ForgeResult;
use crate::primitive::{ArgRole, ExecArgs, PrimitiveKernel};
use rayon::prelude::*;

/// Forward convolution with bias and post-ops
#[derive(Debug)]
pub(crate) struct ConvForwardKernel {
    pub geometry: ConvGeometry,
    pub src: ActIndex,
    pub weights: WeightIndex,
    pub dst: ActIndex,
    pub post_ops: PostOpChain,
    pub has_bias: bool,
    pub parallel: bool,
}

impl ConvForwardKernel {
    fn compute_batch(&self, n: usize, src: &[f32], weights: &[f32], bias: Option<&[f32]>, out: &mut [f32]) {
        let g = &self.geometry;
        let src = &src[n * self.src.n..];
        let (icg, ocg) = (g.in_per_group(), g.out_per_group());

        for oc in 0..g.out_channels {
            let group = oc / ocg;
            let oc_in_group = oc % ocg;
            let bias_value = bias.map_or(0.0, |b| b[oc]);
            for od in 0..g.output[0] {
                for oh in 0..g.output[1] {
                    for ow in 0..g.output[2] {
                        let mut acc = 0.0f32;
                        for ic_in_group in 0..icg {
                            let ic = group * icg + ic_in_group;
                            for kd in 0..g.kernel[0] {
                                let Some(id) = g.input_coord(0, od, kd) else { continue };
                                for kh in 0..g.kernel[1] {
                                    let Some(ih) = g.input_coord(1, oh, kh) else { continue };
                                    for kw in 0..g.kernel[2] {
                                        let Some(iw) = g.input_coord(2, ow, kw) else { continue };
                                        let s = self.src.offset(ic, [id, ih, iw]);
                                        let w = self.weights.offset(group, oc_in_group, ic_in_group, [kd, kh, kw]);
                                        acc += src[s] * weights[w];
                                    }
                                }
                            }
                        }
                        let off = self.dst.offset(oc, [od, oh, ow]);
                        out[off] = self.post_ops.apply(acc + bias_value, oc, out[off]);
                    }
                }
            }
        }
    }
}

impl PrimitiveKernel for ConvForwardKernel {
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        let src = args.require(ArgRole::Src)?;
        let weights = args.require(ArgRole::Weights)?;
        let bias = if self.has_bias {
            Some(args.require(ArgRole::Bias)?)
        } else {
            None
        };

        let per_batch = self.geometry.dst_per_batch();
        if per_batch == 0 || self.geometry.batch == 0 {
            return Ok(());
        }
        let dst = &mut dst[..per_batch * self.geometry.batch];
        let body = |(n, chunk): (usize, &mut [f32])| self.compute_batch(n, src, weights, bias, chunk);
        if self.parallel {
            dst.par_chunks_mut(per_batch).enumerate().for_each(body);
        } else {
            dst.chunks_mut(per_batch).enumerate().for_each(body);
        }
        Ok(())
    }
}

/// Gradient w.r.t. the input: scatter `diff_dst` back through the filter
#[derive(Debug)]
pub(crate) struct ConvBackwardDataKernel {
    pub geometry: ConvGeometry,
    pub diff_dst: ActIndex,
    pub weights: WeightIndex,
    pub diff_src: ActIndex,
    pub parallel: bool,
}

impl ConvBackwardDataKernel {
    fn compute_batch(&self, n: usize, diff_dst: &[f32], weights: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        let g = &self.geometry;
        let diff_dst = &diff_dst[n * self.diff_dst.n..];
        let (icg, ocg) = (g.in_per_group(), g.out_per_group());

        for oc in 0..g.out_channels {
            let group = oc / ocg;
            let oc_in_group = oc % ocg;
            for_each_output(g, |o| {
                let grad = diff_dst[self.diff_dst.offset(oc, o)];
                if grad == 0.0 {
                    return;
                }
                for ic_in_group in 0..icg {
                    let ic = group * icg + ic_in_group;
                    for_each_tap(g, o, |k, i| {
                        let w = self.weights.offset(group, oc_in_group, ic_in_group, k);
                        out[self.diff_src.offset(ic, i)] += grad * weights[w];
                    });
                }
            });
        }
    }
}

impl PrimitiveKernel for ConvBackwardDataKernel {
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        let diff_dst = args.require(ArgRole::DiffDst)?;
        let weights = args.require(ArgRole::Weights)?;
        let per_batch = self.geometry.src_per_batch();
        if per_batch == 0 || self.geometry.batch == 0 {
            return Ok(());
        }
        let dst = &mut dst[..per_batch * self.geometry.batch];
        let body = |(n, chunk): (usize, &mut [f32])| self.compute_batch(n, diff_dst, weights, chunk);
        if self.parallel {
            dst.par_chunks_mut(per_batch).enumerate().for_each(body);
        } else {
            dst.chunks_mut(per_batch).enumerate().for_each(body);
        }
        Ok(())
    }
}

/// Gradient w.r.t. the filter, written in the descriptor's weights layout
#[derive(Debug)]
pub(crate) struct ConvBackwardWeightsKernel {
    pub geometry: ConvGeometry,
    pub src: ActIndex,
    pub diff_dst: ActIndex,
    pub diff_weights: WeightIndex,
    pub weights_count: usize,
}

impl PrimitiveKernel for ConvBackwardWeightsKernel {
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        let src = args.require(ArgRole::Src)?;
        let diff_dst = args.require(ArgRole::DiffDst)?;
        let out = &mut dst[..self.weights_count];
        out.fill(0.0);

        let g = &self.geometry;
        let (icg, ocg) = (g.in_per_group(), g.out_per_group());
        for n in 0..g.batch {
            let src_n = &src[n * self.src.n..];
            let diff_n = &diff_dst[n * self.diff_dst.n..];
            for oc in 0..g.out_channels {
                let group = oc / ocg;
                let oc_in_group = oc % ocg;
                for_each_output(g, |o| {
                    let grad = diff_n[self.diff_dst.offset(oc, o)];
                    if grad == 0.0 {
                        return;
                    }
                    for ic_in_group in 0..icg {
                        let ic = group * icg + ic_in_group;
                        for_each_tap(g, o, |k, i| {
                            let w = self.diff_weights.offset(group, oc_in_group, ic_in_group, k);
                            out[w] += grad * src_n[self.src.offset(ic, i)];
                        });
                    }
                });
            }
        }
        Ok(())
    }
}

#[inline]
fn for_each_output(g: &ConvGeometry, mut f: impl FnMut(Spatial)) {
    for od in 0..g.output[0] {
        for oh in 0..g.output[1] {
            for ow in 0..g.output[2] {
                f([od, oh, ow]);
            }
        }
    }
}

/// Kernel taps of output `o` that land inside the input, with the input position
#[inline]
fn for_each_tap(g: &ConvGeometry, o: Spatial, mut f: impl FnMut(Spatial, Spatial)) {
    for kd in 0..g.kernel[0] {
        let Some(id) = g.input_coord(0, o[0], kd) else { continue };
        for kh in 0..g.kernel[1] {
            let Some(ih) = g.input_coord(1, o[1], kh) else { continue };
            for kw in 0..g.kernel[2] {
                let Some(iw) = g.input_coord(2, o[2], kw) else { continue };
                f([kd, kh, kw], [id, ih, iw]);
            }
        }
    }
}
