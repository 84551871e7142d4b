//! `_FusedMatMulGrad` against a direct reference

mod common;

use common::{assert_close, fresh_engine, matmul_attrs, tensor};
use primforge::{FusedMatMulGradKernel, HostContext, Tensor};
use proptest::prelude::*;

/// `(src^T x diff_dst)` as `[k, channel]`, and column sums of `diff_dst`
fn reference(src: &Tensor, diff_dst: &Tensor) -> (Vec<f32>, Vec<f32>) {
    let (batch, k) = (src.shape()[0], src.shape()[1]);
    let channel = diff_dst.shape()[1];
    let x = src.as_f32().expect("f32 source");
    let g = diff_dst.as_f32().expect("f32 diff_dst");
    let mut weights = vec![0.0f32; k * channel];
    let mut bias = vec![0.0f32; channel];
    for b in 0..batch {
        for c in 0..channel {
            bias[c] += g[b * channel + c];
            for i in 0..k {
                weights[i * channel + c] += x[b * k + i] * g[b * channel + c];
            }
        }
    }
    (weights, bias)
}

fn run(kernel: &FusedMatMulGradKernel, inputs: Vec<Tensor>) -> anyhow::Result<(Tensor, Tensor)> {
    let mut ctx = HostContext::new(inputs);
    kernel.compute(&mut ctx);
    if let Some(err) = ctx.take_status() {
        anyhow::bail!("matmul gradient failed: {}", err);
    }
    let weights = ctx.take_output(0).ok_or_else(|| anyhow::anyhow!("no weight gradient"))?;
    let bias = ctx.take_output(1).ok_or_else(|| anyhow::anyhow!("no bias gradient"))?;
    Ok((weights, bias))
}

#[test]
fn test_repeated_calls_share_one_primitive() -> anyhow::Result<()> {
    let engine = fresh_engine(true);
    let kernel = FusedMatMulGradKernel::configure_with_engine(&matmul_attrs(&["BiasAddGrad"]), engine.clone())?;
    let src = tensor(&[5, 4], 1);
    let diff_dst = tensor(&[5, 3], 2);
    let (expected_w, expected_b) = reference(&src, &diff_dst);
    for _ in 0..3 {
        let (w, b) = run(&kernel, vec![src.clone(), diff_dst.clone()])?;
        assert_eq!(w.shape(), &[4, 3]);
        assert_close(w.as_f32()?, &expected_w, 1e-4);
        assert_close(b.as_f32()?, &expected_b, 1e-5);
    }
    assert_eq!(engine.stats()?.builds, 1);
    Ok(())
}

#[test]
fn test_zero_channels_yields_empty_gradients() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let kernel = FusedMatMulGradKernel::configure_with_engine(&matmul_attrs(&["BiasAddGrad"]), engine.clone())?;
    let (w, b) = run(&kernel, vec![tensor(&[2, 3], 1), tensor(&[2, 0], 2)])?;
    assert_eq!(w.shape(), &[3, 0]);
    assert_eq!(b.shape(), &[0]);
    assert_eq!(engine.stats()?.builds, 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_matches_reference(
        batch in 1usize..6,
        k in 1usize..6,
        channel in 1usize..6,
        transpose_b in any::<bool>(),
        parallel in any::<bool>(),
    ) {
        let kernel = FusedMatMulGradKernel::configure_with_engine(
            &matmul_attrs(&["BiasAddGrad"]).with("transpose_b", transpose_b),
            fresh_engine(parallel),
        ).unwrap();
        let src = tensor(&[batch, k], 3);
        let diff_dst = tensor(&[batch, channel], 4);
        let (expected_w, expected_b) = reference(&src, &diff_dst);
        let (w, b) = run(&kernel, vec![src, diff_dst]).unwrap();

        let w_values = w.as_f32().unwrap();
        if transpose_b {
            prop_assert_eq!(w.shape(), &[channel, k][..]);
            for c in 0..channel {
                for i in 0..k {
                    prop_assert!((w_values[c * k + i] - expected_w[i * channel + c]).abs() < 1e-4);
                }
            }
        } else {
            prop_assert_eq!(w.shape(), &[k, channel][..]);
            assert_close(w_values, &expected_w, 1e-4);
        }
        assert_close(b.as_f32().unwrap(), &expected_b, 1e-5);
    }
}
