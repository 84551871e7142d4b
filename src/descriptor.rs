//! Operation descriptors: the primitive cache key.
//!
//! An [`OperationDescriptor`] captures everything that determines a compiled
//! primitive. Two calls whose descriptors compare equal may share a primitive;
//! any differing field yields a distinct one.

use crate::conv::descriptor::{windowed_output_size, PadSpec};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::{DType, FormatTag};
use std::fmt;
use std::hash::{Hash, Hasher};

/// What the primitive computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    ConvForward,
    /// Gradient w.r.t. the convolution input
    ConvBackwardData,
    /// Gradient w.r.t. the convolution filter
    ConvBackwardWeights,
    InnerProduct,
    /// Gradient w.r.t. the inner-product weights
    InnerProductBackwardWeights,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::ConvForward => "conv_forward",
            OpKind::ConvBackwardData => "conv_backward_data",
            OpKind::ConvBackwardWeights => "conv_backward_weights",
            OpKind::InnerProduct => "inner_product",
            OpKind::InnerProductBackwardWeights => "inner_product_backward_weights",
        }
    }

    pub fn is_convolution(&self) -> bool {
        !matches!(self, OpKind::InnerProduct | OpKind::InnerProductBackwardWeights)
    }
}

/// Elementwise algorithms a primitive can apply after its main computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationAlgorithm {
    /// `x > 0 ? x : alpha * x`
    Relu,
    /// `min(max(x, 0), alpha)`
    BoundedRelu,
    /// `min(max(x, alpha), beta)`
    Clip,
    /// `x > 0 ? x : alpha * (exp(x) - 1)`
    Elu,
    /// tanh approximation
    Gelu,
}

/// Post-operation attached to a primitive, applied in list order.
///
/// Float fields compare and hash by bit pattern so the descriptor stays a
/// usable hash key.
#[derive(Debug, Clone)]
pub enum PostOp {
    Activation {
        algorithm: ActivationAlgorithm,
        scale: f32,
        alpha: f32,
        beta: f32,
    },
    /// `dst = result + scale * dst_before`
    Sum { scale: f32 },
    /// One value, or one value per output channel
    OutputScale { values: Vec<f32> },
}

impl PostOp {
    pub fn activation(algorithm: ActivationAlgorithm, alpha: f32, beta: f32) -> Self {
        PostOp::Activation {
            algorithm,
            scale: 1.0,
            alpha,
            beta,
        }
    }
}

impl PartialEq for PostOp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                PostOp::Activation {
                    algorithm: a1,
                    scale: s1,
                    alpha: al1,
                    beta: b1,
                },
                PostOp::Activation {
                    algorithm: a2,
                    scale: s2,
                    alpha: al2,
                    beta: b2,
                },
            ) => {
                a1 == a2
                    && s1.to_bits() == s2.to_bits()
                    && al1.to_bits() == al2.to_bits()
                    && b1.to_bits() == b2.to_bits()
            }
            (PostOp::Sum { scale: s1 }, PostOp::Sum { scale: s2 }) => s1.to_bits() == s2.to_bits(),
            (PostOp::OutputScale { values: v1 }, PostOp::OutputScale { values: v2 }) => {
                v1.len() == v2.len() && v1.iter().zip(v2).all(|(a, b)| a.to_bits() == b.to_bits())
            }
            _ => false,
        }
    }
}

impl Eq for PostOp {}

impl Hash for PostOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            PostOp::Activation {
                algorithm,
                scale,
                alpha,
                beta,
            } => {
                algorithm.hash(state);
                scale.to_bits().hash(state);
                alpha.to_bits().hash(state);
                beta.to_bits().hash(state);
            }
            PostOp::Sum { scale } => scale.to_bits().hash(state),
            PostOp::OutputScale { values } => {
                values.len().hash(state);
                for value in values {
                    value.to_bits().hash(state);
                }
            }
        }
    }
}

/// Element types of source, filter, bias (if any) and destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DTypeSignature {
    pub src: DType,
    pub weights: DType,
    pub bias: Option<DType>,
    pub dst: DType,
}

impl DTypeSignature {
    /// Same element type everywhere, bias only if present
    pub fn uniform(dtype: DType, has_bias: bool) -> Self {
        Self {
            src: dtype,
            weights: dtype,
            bias: has_bias.then_some(dtype),
            dst: dtype,
        }
    }

    pub fn is_uniform(&self, dtype: DType) -> bool {
        self.src == dtype
            && self.weights == dtype
            && self.dst == dtype
            && self.bias.map_or(true, |b| b == dtype)
    }
}

/// Concatenated element-type names, e.g. `f32f32nonef32`
impl fmt::Display for DTypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bias = self.bias.map_or("none", |b| b.name());
        write!(f, "{}{}{}{}", self.src, self.weights, bias, self.dst)
    }
}

/// Immutable description of one primitive.
///
/// Dims are in canonical logical order: activations `[N, C, spatial..]`,
/// weights `[O, I, spatial..]` or `[G, O/G, I/G, spatial..]` when
/// `groups > 1`, matrices `[batch, channels]` / `[channels, k]`. Dilations
/// use the framework convention where `1` means dense.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationDescriptor {
    pub kind: OpKind,
    pub src_dims: Vec<usize>,
    pub weights_dims: Vec<usize>,
    /// Empty when the operation has no bias
    pub bias_dims: Vec<usize>,
    pub dst_dims: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub padding_left: Vec<usize>,
    pub padding_right: Vec<usize>,
    pub groups: usize,
    /// Layout of source and destination activations
    pub layout: FormatTag,
    /// Requested weights layout; `Any` lets the backend choose
    pub weights_format: FormatTag,
    pub dtypes: DTypeSignature,
    pub post_ops: Vec<PostOp>,
}

impl OperationDescriptor {
    pub fn has_bias(&self) -> bool {
        !self.bias_dims.is_empty()
    }

    pub fn out_channels(&self) -> usize {
        self.dst_dims.get(1).copied().unwrap_or(0)
    }

    pub fn spatial_rank(&self) -> usize {
        self.src_dims.len().saturating_sub(2)
    }

    /// Check the structural invariants a backend relies on.
    ///
    /// Every dimension a backend derives an index range from is cross-checked
    /// against the others: batch, channels, grouped weights and the windowed
    /// spatial sizes.
    pub fn validate(&self) -> ForgeResult<()> {
        let rank = self.src_dims.len();
        let expected_ranks: &[usize] = if self.kind.is_convolution() { &[4, 5] } else { &[2] };
        if !expected_ranks.contains(&rank) || self.dst_dims.len() != rank {
            return Err(ForgeError::ShapeMismatch(format!(
                "{} descriptor has source rank {} and destination rank {}",
                self.kind.name(),
                rank,
                self.dst_dims.len()
            )));
        }

        if self.kind.is_convolution() {
            let spatial = rank - 2;
            let weights_rank = if self.groups > 1 { rank + 1 } else { rank };
            if self.groups == 0 || self.weights_dims.len() != weights_rank {
                return Err(ForgeError::ShapeMismatch(format!(
                    "weights dims {:?} do not fit {} groups at rank {}",
                    self.weights_dims, self.groups, rank
                )));
            }
            for (name, values) in [
                ("strides", &self.strides),
                ("dilations", &self.dilations),
                ("padding_left", &self.padding_left),
                ("padding_right", &self.padding_right),
            ] {
                if values.len() != spatial {
                    return Err(ForgeError::ShapeMismatch(format!(
                        "{} has {} entries for {} spatial dims",
                        name,
                        values.len(),
                        spatial
                    )));
                }
            }
            if self.strides.contains(&0) || self.dilations.contains(&0) {
                return Err(ForgeError::InvalidConfiguration(
                    "strides and dilations must be positive".to_string(),
                ));
            }
            self.validate_conv_geometry()?;
        } else {
            self.validate_matrix_dims()?;
        }

        if self.has_bias() != self.dtypes.bias.is_some() {
            return Err(ForgeError::InvalidConfiguration(format!(
                "bias dims {:?} disagree with data type signature {}",
                self.bias_dims, self.dtypes
            )));
        }

        self.validate_post_ops()
    }

    /// Weights `[O, I, k..]` or `[G, O/G, I/G, k..]` against source and
    /// destination, and each output extent against its window
    fn validate_conv_geometry(&self) -> ForgeResult<()> {
        let (batch, in_channels) = (self.src_dims[0], self.src_dims[1]);
        let out_channels = self.dst_dims[1];
        let (filter_out, filter_in, kernel) = if self.groups > 1 {
            if self.weights_dims[0] != self.groups {
                return Err(ForgeError::ShapeMismatch(format!(
                    "grouped weights {:?} do not lead with {} groups",
                    self.weights_dims, self.groups
                )));
            }
            let total = |per_group: usize| {
                per_group.checked_mul(self.groups).ok_or_else(|| {
                    ForgeError::ShapeMismatch(format!(
                        "grouped weights {:?} overflow the channel count",
                        self.weights_dims
                    ))
                })
            };
            (
                total(self.weights_dims[1])?,
                total(self.weights_dims[2])?,
                &self.weights_dims[3..],
            )
        } else {
            (self.weights_dims[0], self.weights_dims[1], &self.weights_dims[2..])
        };

        if self.dst_dims[0] != batch {
            return Err(ForgeError::ShapeMismatch(format!(
                "destination batch {} differs from source batch {}",
                self.dst_dims[0], batch
            )));
        }
        if filter_in != in_channels || filter_out != out_channels {
            return Err(ForgeError::ShapeMismatch(format!(
                "weights {:?} map {} to {} channels, descriptor has {} to {}",
                self.weights_dims, filter_in, filter_out, in_channels, out_channels
            )));
        }

        for (i, &k) in kernel.iter().enumerate() {
            let extent = windowed_output_size(
                self.src_dims[2 + i],
                k,
                self.dilations[i],
                self.strides[i],
                PadSpec::Explicit {
                    before: self.padding_left[i],
                    after: self.padding_right[i],
                },
            )?;
            if extent.output != self.dst_dims[2 + i] {
                return Err(ForgeError::ShapeMismatch(format!(
                    "spatial dim {} of src {:?} yields {} outputs, dst has {}",
                    i,
                    self.src_dims,
                    extent.output,
                    self.dst_dims[2 + i]
                )));
            }
        }
        Ok(())
    }

    /// `src [batch, k]`, `weights [channels, k]`, `dst [batch, channels]`
    fn validate_matrix_dims(&self) -> ForgeResult<()> {
        let (batch, k) = (self.src_dims[0], self.src_dims[1]);
        let channels = self.dst_dims[1];
        if self.weights_dims != [channels, k] || self.dst_dims[0] != batch {
            return Err(ForgeError::ShapeMismatch(format!(
                "{} dims disagree: src {:?}, weights {:?}, dst {:?}",
                self.kind.name(),
                self.src_dims,
                self.weights_dims,
                self.dst_dims
            )));
        }
        Ok(())
    }

    fn validate_post_ops(&self) -> ForgeResult<()> {
        let mut sums = 0;
        let mut activations = 0;
        for op in &self.post_ops {
            match op {
                PostOp::Sum { .. } => sums += 1,
                PostOp::Activation { .. } => activations += 1,
                PostOp::OutputScale { values } => {
                    let channels = self.out_channels();
                    if values.len() != 1 && values.len() != channels {
                        return Err(ForgeError::InvalidConfiguration(format!(
                            "output scale has {} values for {} output channels",
                            values.len(),
                            channels
                        )));
                    }
                }
            }
        }
        if sums > 1 || activations > 1 {
            return Err(ForgeError::InvalidConfiguration(format!(
                "at most one sum and one activation post-op allowed, got {} and {}",
                sums, activations
            )));
        }
        Ok(())
    }
}

impl fmt::Display for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} src{:?} wei{:?} dst{:?} {} {}",
            self.kind.name(),
            self.src_dims,
            self.weights_dims,
            self.dst_dims,
            self.layout,
            self.dtypes
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    pub(crate) fn sample_conv() -> OperationDescriptor {
        OperationDescriptor {
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

    fn hash_of(desc: &OperationDescriptor) -> u64 {
        let mut hasher = DefaultHasher::new();
        desc.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_equal_descriptors_hash_equal() {
        let a = sample_conv();
        let b = sample_conv();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_post_op_bits_matter() {
        let mut a = sample_conv();
        a.post_ops = vec![PostOp::activation(ActivationAlgorithm::Relu, 0.0, 0.0)];
        let mut b = sample_conv();
        b.post_ops = vec![PostOp::activation(ActivationAlgorithm::Relu, -0.0, 0.0)];
        assert_ne!(a, b);

        let nan = PostOp::Sum { scale: f32::NAN };
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn test_signature_display() {
        assert_eq!(DTypeSignature::uniform(DType::F32, true).to_string(), "f32f32f32f32");
        assert_eq!(DTypeSignature::uniform(DType::F32, false).to_string(), "f32f32nonef32");
        let mixed = DTypeSignature {
            src: DType::Bf16,
            weights: DType::Bf16,
            bias: Some(DType::F32),
            dst: DType::Bf16,
        };
        assert_eq!(mixed.to_string(), "bf16bf16f32bf16");
        assert!(!mixed.is_uniform(DType::Bf16));
    }

    #[test]
    fn test_validate_rejects_double_sum() {
        let mut desc = sample_conv();
        desc.post_ops = vec![PostOp::Sum { scale: 1.0 }, PostOp::Sum { scale: 1.0 }];
        assert!(matches!(desc.validate(), Err(ForgeError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_validate_output_scale_length() {
        let mut desc = sample_conv();
        desc.post_ops = vec![PostOp::OutputScale { values: vec![0.5; 4] }];
        assert!(desc.validate().is_ok());
        desc.post_ops = vec![PostOp::OutputScale { values: vec![0.5; 3] }];
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_validate_rank_and_groups() {
        let mut desc = sample_conv();
        desc.groups = 3;
        assert!(matches!(desc.validate(), Err(ForgeError::ShapeMismatch(_))));

        let mut desc = sample_conv();
        desc.strides = vec![1];
        assert!(matches!(desc.validate(), Err(ForgeError::ShapeMismatch(_))));

        let mut desc = sample_conv();
        desc.bias_dims.clear();
        assert!(matches!(desc.validate(), Err(ForgeError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_validate_cross_checks_dims() {
        let mismatched: Vec<fn(&mut OperationDescriptor)> = vec![
            // weights with one input channel against a 3-channel source
            |d| d.weights_dims = vec![4, 1, 3, 3],
            |d| d.weights_dims = vec![5, 3, 3, 3],
            |d| d.dst_dims = vec![2, 4, 6, 6],
            |d| d.dst_dims = vec![1, 4, 7, 6],
            |d| d.padding_left = vec![1, 0],
            |d| d.dilations = vec![2, 1],
            |d| {
                d.groups = 3;
                d.weights_dims = vec![4, 1, 1, 3, 3];
            },
        ];
        for mutate in mismatched {
            let mut desc = sample_conv();
            mutate(&mut desc);
            assert!(matches!(desc.validate(), Err(ForgeError::ShapeMismatch(_))), "{}", desc);
        }

        let mut grouped = sample_conv();
        grouped.src_dims = vec![1, 4, 8, 8];
        grouped.groups = 2;
        grouped.weights_dims = vec![2, 2, 2, 3, 3];
        assert!(grouped.validate().is_ok());

        let mut padded = sample_conv();
        padded.padding_left = vec![1, 1];
        padded.padding_right = vec![1, 1];
        padded.dst_dims = vec![1, 4, 8, 8];
        assert!(padded.validate().is_ok());
    }

    #[test]
    fn test_validate_matrix_dims() {
        let mut desc = sample_conv();
        desc.kind = OpKind::InnerProduct;
        desc.src_dims = vec![2, 3];
        desc.weights_dims = vec![4, 3];
        desc.dst_dims = vec![2, 4];
        desc.strides.clear();
        desc.dilations.clear();
        desc.padding_left.clear();
        desc.padding_right.clear();
        desc.layout = FormatTag::Nc;
        assert!(desc.validate().is_ok());

        desc.kind = OpKind::InnerProductBackwardWeights;
        assert!(desc.validate().is_ok());

        desc.weights_dims = vec![4, 2];
        assert!(matches!(desc.validate(), Err(ForgeError::ShapeMismatch(_))));
        desc.weights_dims = vec![4, 3];
        desc.dst_dims = vec![3, 4];
        assert!(matches!(desc.validate(), Err(ForgeError::ShapeMismatch(_))));
    }
}
