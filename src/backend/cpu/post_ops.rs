//! Output scaling and post-op chains applied per destination element.

use crate::descriptor::{ActivationAlgorithm, PostOp};
use crate::error::{ForgeError, ForgeResult};

const GELU_CONST: f32 = 0.797_884_6; // sqrt(2/pi)
const GELU_CONST_3: f32 = 0.044715;

/// Elementwise activation
#[inline]
pub fn eltwise(algorithm: ActivationAlgorithm, x: f32, alpha: f32, beta: f32) -> f32 {
    match algorithm {
        ActivationAlgorithm::Relu => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        ActivationAlgorithm::BoundedRelu => x.max(0.0).min(alpha),
        ActivationAlgorithm::Clip => x.max(alpha).min(beta),
        ActivationAlgorithm::Elu => {
            if x > 0.0 {
                x
            } else {
                alpha * (x.exp() - 1.0)
            }
        }
        ActivationAlgorithm::Gelu => {
            let inner = GELU_CONST * (x + GELU_CONST_3 * x * x * x);
            0.5 * x * (1.0 + inner.tanh())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Sum(f32),
    Eltwise {
        algorithm: ActivationAlgorithm,
        scale: f32,
        alpha: f32,
        beta: f32,
    },
}

/// Compiled post-op list of one primitive.
///
/// `value = (acc + bias) * output_scale[oc]`, then each step in order:
/// sums add the previous destination value, activations transform and scale.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct PostOpChain {
    output_scales: Option<Vec<f32>>,
    steps: Vec<Step>,
}

impl PostOpChain {
    pub(crate) fn compile(ops: &[PostOp], out_channels: usize) -> ForgeResult<Self> {
        let mut chain = PostOpChain::default();
        for op in ops {
            match op {
                PostOp::OutputScale { values } => {
                    if values.len() != 1 && values.len() != out_channels {
                        return Err(ForgeError::BackendRejected(format!(
                            "output scale of length {} for {} channels",
                            values.len(),
                            out_channels
                        )));
                    }
                    chain.output_scales = Some(values.clone());
                }
                PostOp::Sum { scale } => chain.steps.push(Step::Sum(*scale)),
                PostOp::Activation {
                    algorithm,
                    scale,
                    alpha,
                    beta,
                } => chain.steps.push(Step::Eltwise {
                    algorithm: *algorithm,
                    scale: *scale,
                    alpha: *alpha,
                    beta: *beta,
                }),
            }
        }
        Ok(chain)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.output_scales.is_none() && self.steps.is_empty()
    }

    /// Final value for output channel `oc`; `previous` is the destination
    /// content before this execution.
    #[inline]
    pub(crate) fn apply(&self, value: f32, oc: usize, previous: f32) -> f32 {
        let mut value = match &self.output_scales {
            Some(scales) if scales.len() == 1 => value * scales[0],
            Some(scales) => value * scales[oc],
            None => value,
        };
        for step in &self.steps {
            value = match *step {
                Step::Sum(scale) => value + scale * previous,
                Step::Eltwise {
                    algorithm,
                    scale,
                    alpha,
                    beta,
                } => scale * eltwise(algorithm, value, alpha, beta),
            };
        }
        value
    }
}
