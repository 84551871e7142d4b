//! End-to-end convolution kernels against a direct reference

mod common;

use common::{
    assert_close, conv2d_attrs, fresh_engine, fused_conv2d_attrs, reference_conv_nhwc, tensor,
};
use primforge::{
    BackpropKind, ConvBackpropKernel, ConvKernel, ConvOp, ForgeError, HostContext, OpKernelContext,
    Tensor,
};
use proptest::prelude::*;

fn run_conv(kernel: &ConvKernel, inputs: Vec<Tensor>) -> anyhow::Result<Tensor> {
    let mut ctx = HostContext::new(inputs);
    kernel.compute(&mut ctx);
    if let Some(err) = ctx.take_status() {
        anyhow::bail!("convolution failed: {}", err);
    }
    ctx.take_output(0).ok_or_else(|| anyhow::anyhow!("no output"))
}

fn nhwc_to_nchw(t: &Tensor) -> Tensor {
    let (n, h, w, c) = (t.shape()[0], t.shape()[1], t.shape()[2], t.shape()[3]);
    let src = t.as_f32().unwrap();
    let mut out = vec![0.0; src.len()];
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                for ch in 0..c {
                    out[((b * c + ch) * h + y) * w + x] = src[((b * h + y) * w + x) * c + ch];
                }
            }
        }
    }
    Tensor::from_f32(vec![n, c, h, w], out).unwrap()
}

#[test]
fn test_same_padding_strided_matches_reference() -> anyhow::Result<()> {
    for parallel in [false, true] {
        let kernel = ConvKernel::configure_with_engine(
            ConvOp::Conv2D,
            &conv2d_attrs([2, 2], "SAME"),
            fresh_engine(parallel),
        )?;
        let src = tensor(&[2, 5, 5, 3], 7);
        let filter = tensor(&[3, 3, 3, 4], 8);
        let out = run_conv(&kernel, vec![src.clone(), filter.clone()])?;
        assert_eq!(out.shape(), &[2, 3, 3, 4]);
        let expected = reference_conv_nhwc(&src, &filter, [2, 2], [1, 1], [3, 3]);
        assert_close(out.as_f32()?, &expected, 1e-4);
    }
    Ok(())
}

#[test]
fn test_explicit_padding_attribute() -> anyhow::Result<()> {
    let attrs = conv2d_attrs([1, 1], "EXPLICIT").with("explicit_paddings", vec![0i64, 0, 1, 2, 0, 1, 0, 0]);
    let kernel = ConvKernel::configure_with_engine(ConvOp::Conv2D, &attrs, fresh_engine(false))?;
    let src = tensor(&[1, 4, 4, 2], 11);
    let filter = tensor(&[2, 2, 2, 3], 12);
    let out = run_conv(&kernel, vec![src.clone(), filter.clone()])?;
    assert_eq!(out.shape(), &[1, 6, 4, 3]);
    let expected = reference_conv_nhwc(&src, &filter, [1, 1], [1, 0], [6, 4]);
    assert_close(out.as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn test_nchw_agrees_with_nhwc() -> anyhow::Result<()> {
    let engine = fresh_engine(true);
    let nhwc = ConvKernel::configure_with_engine(ConvOp::Conv2D, &conv2d_attrs([1, 1], "SAME"), engine.clone())?;
    let nchw_attrs = conv2d_attrs([1, 1], "SAME")
        .with("strides", vec![1i64, 1, 1, 1])
        .with("data_format", "NCHW");
    let nchw = ConvKernel::configure_with_engine(ConvOp::Conv2D, &nchw_attrs, engine)?;

    let src = tensor(&[1, 4, 6, 2], 21);
    let filter = tensor(&[3, 3, 2, 5], 22);
    let a = run_conv(&nhwc, vec![src.clone(), filter.clone()])?;
    let b = run_conv(&nchw, vec![nhwc_to_nchw(&src), filter])?;
    assert_eq!(b.shape(), &[1, 5, 4, 6]);
    assert_close(b.as_f32()?, nhwc_to_nchw(&a).as_f32()?, 1e-4);
    Ok(())
}

#[test]
fn test_conv3d_unit_filter_is_identity() -> anyhow::Result<()> {
    let attrs = primforge::AttrMap::new()
        .with("strides", vec![1i64, 1, 1, 1, 1])
        .with("padding", "VALID")
        .with("data_format", "NDHWC");
    let kernel = ConvKernel::configure_with_engine(ConvOp::Conv3D, &attrs, fresh_engine(false))?;
    let src = tensor(&[1, 2, 3, 3, 2], 31);
    let identity = Tensor::from_f32(vec![1, 1, 1, 2, 2], vec![1.0, 0.0, 0.0, 1.0])?;
    let out = run_conv(&kernel, vec![src.clone(), identity])?;
    assert_eq!(out.shape(), src.shape());
    assert_close(out.as_f32()?, src.as_f32()?, 0.0);
    Ok(())
}

#[test]
fn test_residual_forwarded_or_copied() -> anyhow::Result<()> {
    let kernel = ConvKernel::configure_with_engine(
        ConvOp::FusedConv2D,
        &fused_conv2d_attrs(&["BiasAdd", "Add"], 2),
        fresh_engine(false),
    )?;
    let src = tensor(&[1, 3, 3, 2], 41);
    let filter = tensor(&[1, 1, 2, 2], 42);
    let bias = Tensor::from_f32(vec![2], vec![0.0, 0.0])?;
    let plain = reference_conv_nhwc(&src, &filter, [1, 1], [0, 0], [3, 3]);
    let summand_values = common::ramp(18, 43);
    let expected: Vec<f32> = plain.iter().zip(&summand_values).map(|(a, b)| a + b).collect();

    // sole owner: buffer moves into the output
    let summand = Tensor::from_f32(vec![1, 3, 3, 2], summand_values.clone())?;
    let mut ctx = HostContext::new(vec![src.clone(), filter.clone(), bias.clone(), summand]);
    kernel.compute(&mut ctx);
    assert!(ctx.is_ok(), "{:?}", ctx.status());
    assert!(matches!(ctx.input(3), Err(ForgeError::InvalidArgument(_))));
    assert_close(ctx.output(0).unwrap().as_f32()?, &expected, 1e-4);

    // shared: copied, caller's tensor untouched
    let summand = Tensor::from_f32(vec![1, 3, 3, 2], summand_values.clone())?;
    let kept = summand.clone();
    let mut ctx = HostContext::new(vec![src, filter, bias, summand]);
    kernel.compute(&mut ctx);
    assert!(ctx.is_ok(), "{:?}", ctx.status());
    let out = ctx.output(0).unwrap();
    assert!(!out.shares_buffer_with(&kept));
    assert_close(out.as_f32()?, &expected, 1e-4);
    assert_eq!(kept.as_f32()?, summand_values.as_slice());
    Ok(())
}

#[test]
fn test_residual_size_mismatch() -> anyhow::Result<()> {
    let kernel = ConvKernel::configure_with_engine(
        ConvOp::FusedConv2D,
        &fused_conv2d_attrs(&["BiasAdd", "Add"], 2),
        fresh_engine(false),
    )?;
    let mut ctx = HostContext::new(vec![
        tensor(&[1, 3, 3, 2], 1),
        tensor(&[1, 1, 2, 2], 2),
        tensor(&[2], 3),
        tensor(&[1, 3, 2, 2], 4),
    ]);
    kernel.compute(&mut ctx);
    assert!(matches!(ctx.status(), Some(ForgeError::OutOfBounds { .. })));
    assert!(ctx.output(0).is_none());
    Ok(())
}

#[test]
fn test_bias_shape_errors() -> anyhow::Result<()> {
    let kernel = ConvKernel::configure_with_engine(
        ConvOp::FusedConv2D,
        &fused_conv2d_attrs(&["BiasAdd"], 1),
        fresh_engine(false),
    )?;
    for bias in [tensor(&[3], 1), tensor(&[2, 2], 1)] {
        let mut ctx = HostContext::new(vec![tensor(&[1, 3, 3, 2], 1), tensor(&[1, 1, 2, 2], 2), bias]);
        kernel.compute(&mut ctx);
        assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))));
    }
    Ok(())
}

#[test]
fn test_channel_mismatch_rejected() -> anyhow::Result<()> {
    let kernel = ConvKernel::configure_with_engine(ConvOp::Conv2D, &conv2d_attrs([1, 1], "VALID"), fresh_engine(false))?;
    let mut ctx = HostContext::new(vec![tensor(&[1, 3, 3, 2], 1), tensor(&[1, 1, 3, 2], 2)]);
    kernel.compute(&mut ctx);
    assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))));
    Ok(())
}

#[test]
fn test_huge_window_attributes_rejected() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let huge_pads = conv2d_attrs([1, 1], "EXPLICIT")
        .with("explicit_paddings", vec![0, 0, i64::MAX, i64::MAX, 0, 0, 0, 0]);
    let huge_dilation = conv2d_attrs([1, 1], "VALID").with("dilations", vec![1, i64::MAX, 1, 1]);
    for attrs in [huge_pads, huge_dilation] {
        let kernel = ConvKernel::configure_with_engine(ConvOp::Conv2D, &attrs, engine.clone())?;
        let mut ctx = HostContext::new(vec![tensor(&[1, 2, 2, 1], 1), tensor(&[2, 2, 1, 1], 2)]);
        kernel.compute(&mut ctx);
        assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))), "{:?}", ctx.status());
        assert!(ctx.output(0).is_none());
    }
    assert_eq!(engine.stats()?.builds, 0);
    Ok(())
}

#[test]
fn test_depthwise_single_channel_matches_plain_conv() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let depthwise =
        ConvKernel::configure_with_engine(ConvOp::DepthwiseConv2dNative, &conv2d_attrs([1, 1], "VALID"), engine)?;
    let src = tensor(&[1, 4, 5, 1], 51);
    let filter = tensor(&[2, 3, 1, 3], 52);
    let out = run_conv(&depthwise, vec![src.clone(), filter.clone()])?;
    assert_eq!(out.shape(), &[1, 3, 3, 3]);
    let expected = reference_conv_nhwc(&src, &filter, [1, 1], [0, 0], [3, 3]);
    assert_close(out.as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn test_zero_sized_forward_regression() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let kernel = ConvKernel::configure_with_engine(ConvOp::Conv2D, &conv2d_attrs([1, 1], "VALID"), engine.clone())?;

    for (src_shape, filter_shape, expected) in [
        (&[1usize, 1, 1, 1][..], &[2usize, 2, 1, 1][..], &[1usize, 0, 0, 1][..]),
        (&[0, 4, 4, 1][..], &[3, 3, 1, 2][..], &[0, 2, 2, 2][..]),
    ] {
        let out = run_conv(&kernel, vec![tensor(src_shape, 1), tensor(filter_shape, 2)])?;
        assert_eq!(out.shape(), expected);
        assert_eq!(out.num_elements(), 0);
    }
    assert_eq!(engine.stats()?.builds, 0);
    Ok(())
}

#[test]
fn test_zero_sized_gradient_regression() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let input_grad =
        ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &conv2d_attrs([1, 1], "VALID"), engine.clone())?;
    let mut ctx = HostContext::new(vec![
        Tensor::vector_i32(&[0, 0, 0, 0]),
        tensor(&[1, 1, 1, 1], 1),
        tensor(&[1, 1, 1, 1], 2),
    ]);
    input_grad.compute(&mut ctx);
    assert!(ctx.is_ok(), "{:?}", ctx.status());
    assert_eq!(ctx.output(0).unwrap().shape(), &[0, 0, 0, 0]);

    let filter_grad =
        ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &conv2d_attrs([1, 1], "VALID"), engine.clone())?;
    // empty out_backprop: zero-filled gradient of the declared shape
    let mut ctx = HostContext::new(vec![
        tensor(&[1, 1, 1, 1], 3),
        Tensor::vector_i32(&[1, 1, 1, 2]),
        tensor(&[0, 0, 0, 0], 4),
    ]);
    filter_grad.compute(&mut ctx);
    assert!(ctx.is_ok(), "{:?}", ctx.status());
    let out = ctx.output(0).unwrap();
    assert_eq!(out.shape(), &[1, 1, 1, 2]);
    assert_eq!(out.as_f32()?, &[0.0, 0.0]);
    assert_eq!(engine.stats()?.builds, 0);
    Ok(())
}

#[test]
fn test_filter_sizes_mismatch_rejected_before_compute() -> anyhow::Result<()> {
    let engine = fresh_engine(false);
    let kernel =
        ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &conv2d_attrs([1, 1], "VALID"), engine.clone())?;
    for sizes in [
        Tensor::vector_i32(&[3, 3, 3, 4]),
        Tensor::vector_i32(&[3, 3, 2, 4, 1]),
        Tensor::vector_i32(&[3, 3, 2, 5]),
    ] {
        let mut ctx = HostContext::new(vec![tensor(&[1, 4, 4, 2], 1), sizes, tensor(&[1, 2, 2, 4], 2)]);
        kernel.compute(&mut ctx);
        assert!(matches!(ctx.status(), Some(ForgeError::ShapeMismatch(_))), "{:?}", ctx.status());
        assert!(ctx.output(0).is_none());
    }
    assert_eq!(engine.stats()?.builds, 0);
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// <conv(x, w), dy> == <x, dx(dy, w)> == <w, dw(x, dy)>
    #[test]
    fn prop_gradients_are_adjoint(
        h in 3usize..7,
        w in 3usize..7,
        c in 1usize..4,
        oc in 1usize..4,
        k in 1usize..4,
        stride in 1i64..3,
        same in any::<bool>(),
        seed in 0u32..1000,
    ) {
        let padding = if same { "SAME" } else { "VALID" };
        let attrs = conv2d_attrs([stride, stride], padding);
        let engine = fresh_engine(false);
        let forward = ConvKernel::configure_with_engine(ConvOp::Conv2D, &attrs, engine.clone()).unwrap();
        let input_grad = ConvBackpropKernel::configure_with_engine(BackpropKind::Input, &attrs, engine.clone()).unwrap();
        let filter_grad = ConvBackpropKernel::configure_with_engine(BackpropKind::Filter, &attrs, engine).unwrap();

        let x = tensor(&[1, h, w, c], seed);
        let f = tensor(&[k, k, c, oc], seed + 1);
        let y = run_conv(&forward, vec![x.clone(), f.clone()]).unwrap();
        let dy = tensor(y.shape(), seed + 2);
        prop_assume!(y.num_elements() > 0);

        let mut ctx = HostContext::new(vec![
            Tensor::vector_i32(&[1, h as i32, w as i32, c as i32]),
            f.clone(),
            dy.clone(),
        ]);
        input_grad.compute(&mut ctx);
        prop_assert!(ctx.is_ok(), "{:?}", ctx.status());
        let dx = ctx.take_output(0).unwrap();

        let mut ctx = HostContext::new(vec![
            x.clone(),
            Tensor::vector_i32(&[k as i32, k as i32, c as i32, oc as i32]),
            dy.clone(),
        ]);
        filter_grad.compute(&mut ctx);
        prop_assert!(ctx.is_ok(), "{:?}", ctx.status());
        let df = ctx.take_output(0).unwrap();

        let lhs = dot(y.as_f32().unwrap(), dy.as_f32().unwrap());
        let via_input = dot(x.as_f32().unwrap(), dx.as_f32().unwrap());
        let via_filter = dot(f.as_f32().unwrap(), df.as_f32().unwrap());
        prop_assert!((lhs - via_input).abs() < 1e-3, "{} vs {}", lhs, via_input);
        prop_assert!((lhs - via_filter).abs() < 1e-3, "{} vs {}", lhs, via_filter);
    }
}
