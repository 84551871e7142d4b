//! Shared fixtures for integration tests
//!
//! - fresh engines so cache counters start at zero
//! - attribute builders for the convolution and matmul nodes
//! - deterministic tensors and a naive NHWC reference convolution

#![allow(dead_code)]

use primforge::{AttrMap, Engine, ForgeConfig, Tensor};
use std::sync::Arc;

pub use serial_test::serial;

/// Isolated engine; `parallel` toggles the rayon split in the CPU backend
pub fn fresh_engine(parallel: bool) -> Arc<Engine> {
    Arc::new(Engine::new(
        ForgeConfig::new()
            .with_primitive_cache_capacity(64)
            .with_parallel_execution(parallel),
    ))
}

/// NHWC 2-D convolution attributes
pub fn conv2d_attrs(strides: [i64; 2], padding: &str) -> AttrMap {
    AttrMap::new()
        .with("T", "float")
        .with("strides", vec![1, strides[0], strides[1], 1])
        .with("padding", padding)
        .with("data_format", "NHWC")
}

/// `conv2d_attrs` plus a fused-op list and operand count
pub fn fused_conv2d_attrs(fused_ops: &[&str], num_args: i64) -> AttrMap {
    conv2d_attrs([1, 1], "SAME")
        .with("fused_ops", fused_ops.to_vec())
        .with("num_args", num_args)
}

pub fn matmul_attrs(fused_ops: &[&str]) -> AttrMap {
    AttrMap::new()
        .with("T", "float")
        .with("transpose_a", false)
        .with("transpose_b", false)
        .with("fused_ops", fused_ops.to_vec())
}

/// Deterministic values in [-1, 1)
pub fn ramp(count: usize, seed: u32) -> Vec<f32> {
    (0..count)
        .map(|i| {
            let v = (i as u32).wrapping_mul(2654435761).wrapping_add(seed.wrapping_mul(40503)) % 2000;
            v as f32 / 1000.0 - 1.0
        })
        .collect()
}

pub fn tensor(shape: &[usize], seed: u32) -> Tensor {
    let count = shape.iter().product();
    Tensor::from_f32(shape.to_vec(), ramp(count, seed)).expect("shape and data agree")
}

/// Direct NHWC x HWIO convolution with explicit per-side pads
pub fn reference_conv_nhwc(
    src: &Tensor,
    filter: &Tensor,
    strides: [usize; 2],
    pad_before: [usize; 2],
    out_hw: [usize; 2],
) -> Vec<f32> {
    let (n, h, w, c) = (src.shape()[0], src.shape()[1], src.shape()[2], src.shape()[3]);
    let (kh, kw, oc) = (filter.shape()[0], filter.shape()[1], filter.shape()[3]);
    let x = src.as_f32().expect("f32 source");
    let f = filter.as_f32().expect("f32 filter");
    let mut out = vec![0.0f32; n * out_hw[0] * out_hw[1] * oc];
    for b in 0..n {
        for oy in 0..out_hw[0] {
            for ox in 0..out_hw[1] {
                for o in 0..oc {
                    let mut acc = 0.0f32;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * strides[0] + ky) as isize - pad_before[0] as isize;
                            let ix = (ox * strides[1] + kx) as isize - pad_before[1] as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            for i in 0..c {
                                let xv = x[((b * h + iy as usize) * w + ix as usize) * c + i];
                                let fv = f[((ky * kw + kx) * c + i) * oc + o];
                                acc += xv * fv;
                            }
                        }
                    }
                    out[((b * out_hw[0] + oy) * out_hw[1] + ox) * oc + o] = acc;
                }
            }
        }
    }
    out
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {} differs: {} vs {} (tolerance {})",
            i,
            a,
            e,
            tolerance
        );
    }
}

/// NHWC 3x3 convolution, 3 -> 4 channels, bias and ReLU
pub fn base_descriptor() -> primforge::OperationDescriptor {
    use primforge::descriptor::DTypeSignature;
    use primforge::{ActivationAlgorithm, DType, FormatTag, OpKind, PostOp};

    primforge::OperationDescriptor {
        kind: OpKind::ConvForward,
        src_dims: vec![1, 3, 8, 8],
        weights_dims: vec![4, 3, 3, 3],
        bias_dims: vec![4],
        dst_dims: vec![1, 4, 6, 6],
        strides: vec![1, 1],
        dilations: vec![1, 1],
        padding_left: vec![0, 0],
        padding_right: vec![0, 0],
        groups: 1,
        layout: FormatTag::Nhwc,
        weights_format: FormatTag::Any,
        dtypes: DTypeSignature::uniform(DType::F32, true),
        post_ops: vec![PostOp::activation(ActivationAlgorithm::Relu, 0.0, 0.0)],
    }
}
