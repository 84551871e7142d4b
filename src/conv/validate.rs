//! Static attribute validation for the convolution family.
//!
//! Runs once at kernel construction. Everything here is a pure function of
//! the declared attributes; failures are `InvalidConfiguration`.

use super::layout::{DataFormat, PadAmounts};
use crate::error::{ForgeError, ForgeResult};
use crate::framework::AttrMap;

/// Padding mode named by the `padding` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    Same,
    Valid,
    Explicit,
}

impl Padding {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SAME" => Some(Padding::Same),
            "VALID" => Some(Padding::Valid),
            "EXPLICIT" => Some(Padding::Explicit),
            _ => None,
        }
    }
}

/// Attributes exactly as declared on the node
#[derive(Debug, Clone, Default)]
pub struct RawConvAttrs {
    pub strides: Vec<i64>,
    pub dilations: Option<Vec<i64>>,
    pub padding: String,
    pub data_format: Option<String>,
    pub padding_list: Option<Vec<i64>>,
    pub explicit_paddings: Option<Vec<i64>>,
}

impl RawConvAttrs {
    pub fn from_attrs(attrs: &AttrMap) -> ForgeResult<Self> {
        Ok(Self {
            strides: attrs.get_int_list("strides")?,
            dilations: attrs.get_opt_int_list("dilations")?,
            padding: attrs.get_str("padding")?,
            data_format: attrs.get_opt_str("data_format")?,
            padding_list: attrs.get_opt_int_list("padding_list")?,
            explicit_paddings: attrs.get_opt_int_list("explicit_paddings")?,
        })
    }
}

/// Validated static convolution attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ConvAttrs {
    pub format: DataFormat,
    /// Spatial strides, layout-independent order (D, H, W)
    pub strides: Vec<usize>,
    /// Spatial dilations, `1` means dense
    pub dilations: Vec<usize>,
    pub padding: Padding,
    /// Pads from the attribute list when it carries any non-zero entry or
    /// the mode is `EXPLICIT`
    pub explicit_pads: Option<PadAmounts>,
}

impl ConvAttrs {
    pub fn from_attrs(attrs: &AttrMap) -> ForgeResult<Self> {
        validate_conv_attrs(&RawConvAttrs::from_attrs(attrs)?)
    }

    pub fn rank(&self) -> usize {
        self.format.rank()
    }
}

/// Validate declared strides, dilations, padding and layout.
pub fn validate_conv_attrs(raw: &RawConvAttrs) -> ForgeResult<ConvAttrs> {
    let rank = raw.strides.len();
    if rank != 4 && rank != 5 {
        return Err(config("sliding window strides field must specify 4 or 5 dimensions"));
    }

    let format = match &raw.data_format {
        Some(name) => DataFormat::parse(name)
            .ok_or_else(|| config(format!("Invalid data format '{}'", name)))?,
        None => DataFormat::default_for_rank(rank)
            .ok_or_else(|| config("no default data format for this rank"))?,
    };
    if format.rank() != rank {
        return Err(config(format!(
            "data format {} needs {} strides, got {}",
            format,
            format.rank(),
            rank
        )));
    }

    let (stride_n, stride_c) = format.batch_and_channel(&raw.strides);
    if stride_n != 1 || stride_c != 1 {
        return Err(config(
            "Current implementation does not yet support strides in the batch and depth dimensions.",
        ));
    }
    let strides = spatial_positive(format, &raw.strides, "strides")?;

    let dilations = match &raw.dilations {
        Some(values) => {
            if values.len() != rank {
                return Err(config(format!(
                    "dilations has {} entries, strides has {}",
                    values.len(),
                    rank
                )));
            }
            let (dil_n, dil_c) = format.batch_and_channel(values);
            if dil_n != 1 || dil_c != 1 {
                return Err(config(
                    "Current implementation does not yet support dilations in the batch and depth dimensions.",
                ));
            }
            spatial_positive(format, values, "dilations")?
        }
        None => vec![1; format.spatial_rank()],
    };

    let padding = Padding::parse(&raw.padding)
        .ok_or_else(|| config(format!("Invalid padding '{}'", raw.padding)))?;

    if raw.padding_list.is_some() && raw.explicit_paddings.is_some() {
        return Err(config("Can only have 1 `padding` list at most"));
    }
    let list = raw
        .padding_list
        .as_ref()
        .or(raw.explicit_paddings.as_ref())
        .filter(|values| !values.is_empty());

    let explicit_pads = match (padding, list) {
        (Padding::Explicit, None) => {
            return Err(config("EXPLICIT padding requires an explicit padding list"))
        }
        (_, None) => None,
        (_, Some(values)) => {
            if values.len() != 2 * rank {
                return Err(config(format!(
                    "padding list must have {} entries, got {}",
                    2 * rank,
                    values.len()
                )));
            }
            if values.iter().any(|&v| v < 0) {
                return Err(config(format!("padding list has negative entries: {:?}", values)));
            }
            let b = 2 * format.batch_position();
            let c = 2 * format.channel_position();
            if values[b] != 0 || values[b + 1] != 0 || values[c] != 0 || values[c + 1] != 0 {
                return Err(config("explicit padding in the batch or channel dimension is not supported"));
            }
            let pads = PadAmounts::from_layout_list(format, values)?;
            if padding == Padding::Explicit || !pads.is_zero() {
                Some(pads)
            } else {
                None
            }
        }
    };

    Ok(ConvAttrs {
        format,
        strides,
        dilations,
        padding,
        explicit_pads,
    })
}

fn spatial_positive(format: DataFormat, values: &[i64], what: &str) -> ForgeResult<Vec<usize>> {
    (0..format.spatial_rank())
        .map(|i| {
            let value = values[format.spatial_position(i)];
            if value <= 0 {
                return Err(config(format!("{} must be positive, got {:?}", what, values)));
            }
            usize::try_from(value).map_err(|_| config(format!("{} out of range: {}", what, value)))
        })
        .collect()
}

fn config(msg: impl Into<String>) -> ForgeError {
    ForgeError::InvalidConfiguration(msg.into())
}
