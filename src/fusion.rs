//! Fusion policy: which post-operations may be folded into a primitive.
//!
//! A kernel declares its fused operations once, as an ordered list of names
//! (`["BiasAdd", "Add", "Relu"]`). [`FusionPolicy::resolve`] checks the list
//! against the legal combinations for the op family and produces the
//! [`FusionConfig`] that the kernel keeps for its lifetime.

use crate::descriptor::{ActivationAlgorithm, PostOp};
use crate::error::{ForgeError, ForgeResult};
use std::fmt;

/// Activations a fused op list may name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Relu,
    Relu6,
    BoundedRelu,
    Clip,
    Elu,
    LeakyRelu,
    Gelu,
}

impl ActivationKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Relu" => Some(ActivationKind::Relu),
            "Relu6" => Some(ActivationKind::Relu6),
            "BoundedRelu" => Some(ActivationKind::BoundedRelu),
            "Clip" => Some(ActivationKind::Clip),
            "Elu" => Some(ActivationKind::Elu),
            "LeakyRelu" => Some(ActivationKind::LeakyRelu),
            "Gelu" | "GeluApproximate" => Some(ActivationKind::Gelu),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "Relu",
            ActivationKind::Relu6 => "Relu6",
            ActivationKind::BoundedRelu => "BoundedRelu",
            ActivationKind::Clip => "Clip",
            ActivationKind::Elu => "Elu",
            ActivationKind::LeakyRelu => "LeakyRelu",
            ActivationKind::Gelu => "Gelu",
        }
    }

    /// Number of user-supplied parameters
    pub fn param_count(&self) -> usize {
        match self {
            ActivationKind::BoundedRelu | ActivationKind::LeakyRelu => 1,
            ActivationKind::Clip => 2,
            _ => 0,
        }
    }
}

/// A validated activation with its parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedActivation {
    pub kind: ActivationKind,
    pub alpha: f32,
    pub beta: f32,
}

impl FusedActivation {
    fn new(kind: ActivationKind, params: &[f32]) -> ForgeResult<Self> {
        if params.len() != kind.param_count() {
            return Err(ForgeError::UnsupportedFusion(format!(
                "{} takes {} parameter(s), got {}",
                kind.name(),
                kind.param_count(),
                params.len()
            )));
        }
        if params.iter().any(|p| !p.is_finite()) {
            return Err(ForgeError::UnsupportedFusion(format!(
                "{} parameters must be finite, got {:?}",
                kind.name(),
                params
            )));
        }
        let (alpha, beta) = match kind {
            ActivationKind::Relu | ActivationKind::Gelu => (0.0, 0.0),
            ActivationKind::Relu6 => (6.0, 0.0),
            ActivationKind::Elu => (1.0, 0.0),
            ActivationKind::BoundedRelu | ActivationKind::LeakyRelu => (params[0], 0.0),
            ActivationKind::Clip => {
                if params[0] > params[1] {
                    return Err(ForgeError::UnsupportedFusion(format!(
                        "Clip lower bound {} exceeds upper bound {}",
                        params[0], params[1]
                    )));
                }
                (params[0], params[1])
            }
        };
        Ok(Self { kind, alpha, beta })
    }

    pub fn algorithm(&self) -> ActivationAlgorithm {
        match self.kind {
            ActivationKind::Relu | ActivationKind::LeakyRelu => ActivationAlgorithm::Relu,
            ActivationKind::Relu6 | ActivationKind::BoundedRelu => ActivationAlgorithm::BoundedRelu,
            ActivationKind::Clip => ActivationAlgorithm::Clip,
            ActivationKind::Elu => ActivationAlgorithm::Elu,
            ActivationKind::Gelu => ActivationAlgorithm::Gelu,
        }
    }

    pub fn post_op(&self) -> PostOp {
        PostOp::activation(self.algorithm(), self.alpha, self.beta)
    }
}

/// One entry of a declared fused-op list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FusedOp {
    BiasAdd,
    ResidualAdd,
    Activation(ActivationKind),
}

impl FusedOp {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "BiasAdd" => Some(FusedOp::BiasAdd),
            "Add" | "AddV2" | "ResidualAdd" => Some(FusedOp::ResidualAdd),
            other => ActivationKind::from_name(other).map(FusedOp::Activation),
        }
    }
}

/// Legal shapes of a fused-op list, in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionPattern {
    Plain,
    BiasAdd,
    Activation,
    BiasAddActivation,
    BiasAddResidual,
    BiasAddResidualActivation,
}

impl FusionPattern {
    pub const ALL: [FusionPattern; 6] = [
        FusionPattern::Plain,
        FusionPattern::BiasAdd,
        FusionPattern::Activation,
        FusionPattern::BiasAddActivation,
        FusionPattern::BiasAddResidual,
        FusionPattern::BiasAddResidualActivation,
    ];

    const FUSED: &'static [FusionPattern] = &[
        FusionPattern::BiasAdd,
        FusionPattern::Activation,
        FusionPattern::BiasAddActivation,
        FusionPattern::BiasAddResidual,
        FusionPattern::BiasAddResidualActivation,
    ];

    const BIAS_ONLY: &'static [FusionPattern] =
        &[FusionPattern::BiasAdd, FusionPattern::BiasAddActivation];
}

/// Op families with distinct fusion rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    /// Plain convolution or depthwise convolution, nothing fused
    Unfused,
    Convolution,
    DepthwiseConvolution,
    MatMul,
}

/// Per-family legality table
#[derive(Debug, Clone, Copy)]
pub struct FusionPolicy {
    family: OpFamily,
    patterns: &'static [FusionPattern],
    activations: &'static [ActivationKind],
    allows_pad: bool,
}

const ALL_ACTIVATIONS: &[ActivationKind] = &[
    ActivationKind::Relu,
    ActivationKind::Relu6,
    ActivationKind::BoundedRelu,
    ActivationKind::Clip,
    ActivationKind::Elu,
    ActivationKind::LeakyRelu,
    ActivationKind::Gelu,
];

impl FusionPolicy {
    pub fn for_family(family: OpFamily) -> Self {
        match family {
            OpFamily::Unfused => Self {
                family,
                patterns: &[FusionPattern::Plain],
                activations: &[],
                allows_pad: true,
            },
            OpFamily::Convolution => Self {
                family,
                patterns: FusionPattern::FUSED,
                activations: ALL_ACTIVATIONS,
                allows_pad: true,
            },
            OpFamily::DepthwiseConvolution => Self {
                family,
                patterns: FusionPattern::BIAS_ONLY,
                activations: &[ActivationKind::Relu, ActivationKind::Relu6, ActivationKind::Elu],
                allows_pad: false,
            },
            OpFamily::MatMul => Self {
                family,
                patterns: FusionPattern::BIAS_ONLY,
                activations: &[
                    ActivationKind::Relu,
                    ActivationKind::Relu6,
                    ActivationKind::Elu,
                    ActivationKind::Gelu,
                ],
                allows_pad: false,
            },
        }
    }

    pub fn family(&self) -> OpFamily {
        self.family
    }

    /// Validate a declared fused-op list.
    ///
    /// `num_args` counts the extra tensor operands after source and filter;
    /// it must equal one per bias plus one per residual operand.
    pub fn resolve(&self, request: &FusionRequest<'_>) -> ForgeResult<FusionConfig> {
        let unsupported = || {
            ForgeError::UnsupportedFusion(format!(
                "Fusion is not implemented: [{}]",
                request.fused_ops.join(",")
            ))
        };

        let ops = request
            .fused_ops
            .iter()
            .map(|name| FusedOp::parse(name))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(unsupported)?;

        let (pattern, activation) = match ops.as_slice() {
            [] => (FusionPattern::Plain, None),
            [FusedOp::BiasAdd] => (FusionPattern::BiasAdd, None),
            [FusedOp::Activation(kind)] => (FusionPattern::Activation, Some(*kind)),
            [FusedOp::BiasAdd, FusedOp::Activation(kind)] => {
                (FusionPattern::BiasAddActivation, Some(*kind))
            }
            [FusedOp::BiasAdd, FusedOp::ResidualAdd] => (FusionPattern::BiasAddResidual, None),
            [FusedOp::BiasAdd, FusedOp::ResidualAdd, FusedOp::Activation(kind)] => {
                (FusionPattern::BiasAddResidualActivation, Some(*kind))
            }
            _ => return Err(unsupported()),
        };

        if !self.patterns.contains(&pattern) {
            return Err(unsupported());
        }
        if let Some(kind) = activation {
            if !self.activations.contains(&kind) {
                return Err(unsupported());
            }
        }
        if request.explicit_pad && !self.allows_pad {
            return Err(ForgeError::UnsupportedFusion(format!(
                "pad fusion is not available for {:?}",
                self.family
            )));
        }

        let activation = match activation {
            Some(kind) => Some(FusedActivation::new(kind, request.activation_params)?),
            None if !request.activation_params.is_empty() => {
                return Err(ForgeError::UnsupportedFusion(format!(
                    "activation parameters {:?} given without an activation",
                    request.activation_params
                )))
            }
            None => None,
        };

        let config = FusionConfig {
            pattern,
            activation,
            explicit_pad: request.explicit_pad,
        };
        if request.num_args != config.extra_operands() {
            return Err(ForgeError::UnsupportedFusion(format!(
                "[{}] needs {} extra operand(s), node declares {}",
                request.fused_ops.join(","),
                config.extra_operands(),
                request.num_args
            )));
        }
        Ok(config)
    }
}

/// Declared fusion of one node
#[derive(Debug, Clone, Copy)]
pub struct FusionRequest<'a> {
    pub fused_ops: &'a [String],
    pub num_args: usize,
    pub activation_params: &'a [f32],
    pub explicit_pad: bool,
}

/// Validated fusion of one kernel instance
#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pattern: FusionPattern,
    activation: Option<FusedActivation>,
    explicit_pad: bool,
}

impl FusionConfig {
    /// Nothing fused
    pub fn none() -> Self {
        Self {
            pattern: FusionPattern::Plain,
            activation: None,
            explicit_pad: false,
        }
    }

    pub fn pattern(&self) -> FusionPattern {
        self.pattern
    }

    pub fn has_bias(&self) -> bool {
        matches!(
            self.pattern,
            FusionPattern::BiasAdd
                | FusionPattern::BiasAddActivation
                | FusionPattern::BiasAddResidual
                | FusionPattern::BiasAddResidualActivation
        )
    }

    pub fn has_residual(&self) -> bool {
        matches!(
            self.pattern,
            FusionPattern::BiasAddResidual | FusionPattern::BiasAddResidualActivation
        )
    }

    pub fn has_activation(&self) -> bool {
        self.activation.is_some()
    }

    pub fn has_explicit_pad(&self) -> bool {
        self.explicit_pad
    }

    pub fn activation(&self) -> Option<&FusedActivation> {
        self.activation.as_ref()
    }

    pub fn extra_operands(&self) -> usize {
        usize::from(self.has_bias()) + usize::from(self.has_residual())
    }

    /// Post-op list: residual sum first, then the activation
    pub fn post_ops(&self) -> Vec<PostOp> {
        let mut ops = Vec::with_capacity(2);
        if self.has_residual() {
            ops.push(PostOp::Sum { scale: 1.0 });
        }
        if let Some(activation) = &self.activation {
            ops.push(activation.post_op());
        }
        ops
    }
}

impl fmt::Display for FusionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.has_bias() {
            parts.push("BiasAdd");
        }
        if self.has_residual() {
            parts.push("Add");
        }
        if let Some(activation) = &self.activation {
            parts.push(activation.kind.name());
        }
        write!(f, "[{}]", parts.join(","))
    }
}
