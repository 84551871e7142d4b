//! Physical layouts of logical tensors.
//!
//! Every layout is a permutation of a canonical logical dimension order:
//! activations `[N, C, (D,) H, W]`, plain weights `[O, I, (D,) H, W]`,
//! grouped weights `[G, O, I, H, W]`, matrices `[rows, cols]`.

use std::fmt;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    Bf16,
    I32,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::Bf16 => "bf16",
            DType::I32 => "s32",
        }
    }

    /// Parse the framework's `T` attribute value
    pub fn from_type_attr(value: &str) -> Option<Self> {
        match value {
            "float" | "f32" | "DT_FLOAT" => Some(DType::F32),
            "bfloat16" | "bf16" | "DT_BFLOAT16" => Some(DType::Bf16),
            "int32" | "s32" | "DT_INT32" => Some(DType::I32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout tag. `Any` lets the backend pick during primitive construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
    Oihw,
    Hwio,
    Oidhw,
    Dhwio,
    Goihw,
    Hwigo,
    Nc,
    /// Transposed matrix: `[batch, k]` stored column-major
    Cn,
    Oi,
    Io,
    X,
    Any,
}

impl FormatTag {
    /// Logical dimension indices from outermost to innermost in memory.
    ///
    /// `None` for [`FormatTag::Any`].
    pub fn physical_order(&self) -> Option<&'static [usize]> {
        let order: &'static [usize] = match self {
            FormatTag::Nchw | FormatTag::Oihw => &[0, 1, 2, 3],
            FormatTag::Nhwc => &[0, 2, 3, 1],
            FormatTag::Hwio => &[2, 3, 1, 0],
            FormatTag::Ncdhw | FormatTag::Oidhw | FormatTag::Goihw => &[0, 1, 2, 3, 4],
            FormatTag::Ndhwc => &[0, 2, 3, 4, 1],
            FormatTag::Dhwio => &[2, 3, 4, 1, 0],
            FormatTag::Hwigo => &[3, 4, 2, 0, 1],
            FormatTag::Nc | FormatTag::Oi => &[0, 1],
            FormatTag::Io | FormatTag::Cn => &[1, 0],
            FormatTag::X => &[0],
            FormatTag::Any => return None,
        };
        Some(order)
    }

    pub fn rank(&self) -> Option<usize> {
        self.physical_order().map(<[usize]>::len)
    }

    /// Activation layouts keep the batch dimension outermost
    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            FormatTag::Nchw | FormatTag::Nhwc | FormatTag::Ncdhw | FormatTag::Ndhwc
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FormatTag::Nchw => "nchw",
            FormatTag::Nhwc => "nhwc",
            FormatTag::Ncdhw => "ncdhw",
            FormatTag::Ndhwc => "ndhwc",
            FormatTag::Oihw => "oihw",
            FormatTag::Hwio => "hwio",
            FormatTag::Oidhw => "oidhw",
            FormatTag::Dhwio => "dhwio",
            FormatTag::Goihw => "goihw",
            FormatTag::Hwigo => "hwigo",
            FormatTag::Nc => "nc",
            FormatTag::Cn => "cn",
            FormatTag::Oi => "oi",
            FormatTag::Io => "io",
            FormatTag::X => "x",
            FormatTag::Any => "any",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
