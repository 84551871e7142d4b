//! Data layouts of convolution activations.
//!
//! Each layout has a position table telling where batch, channel and every
//! spatial dimension sit in a user-ordered shape or attribute list. Explicit
//! padding lists hold two slots per layout position, so spatial dim `i` at
//! position `p` reads its pads from slots `2p` (before) and `2p + 1` (after).

use crate::error::{ensure_addressable, ForgeError, ForgeResult};
use crate::memory::FormatTag;
use std::fmt;

/// Activation data layout named by the `data_format` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataFormat {
    Nhwc,
    Nchw,
    Ndhwc,
    Ncdhw,
}

struct Positions {
    batch: usize,
    channel: usize,
    spatial: &'static [usize],
}

const NHWC: Positions = Positions {
    batch: 0,
    channel: 3,
    spatial: &[1, 2],
};
const NCHW: Positions = Positions {
    batch: 0,
    channel: 1,
    spatial: &[2, 3],
};
const NDHWC: Positions = Positions {
    batch: 0,
    channel: 4,
    spatial: &[1, 2, 3],
};
const NCDHW: Positions = Positions {
    batch: 0,
    channel: 1,
    spatial: &[2, 3, 4],
};

impl DataFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NHWC" => Some(DataFormat::Nhwc),
            "NCHW" => Some(DataFormat::Nchw),
            "NDHWC" => Some(DataFormat::Ndhwc),
            "NCDHW" => Some(DataFormat::Ncdhw),
            _ => None,
        }
    }

    /// Default layout for a given rank
    pub fn default_for_rank(rank: usize) -> Option<Self> {
        match rank {
            4 => Some(DataFormat::Nhwc),
            5 => Some(DataFormat::Ndhwc),
            _ => None,
        }
    }

    fn positions(&self) -> &'static Positions {
        match self {
            DataFormat::Nhwc => &NHWC,
            DataFormat::Nchw => &NCHW,
            DataFormat::Ndhwc => &NDHWC,
            DataFormat::Ncdhw => &NCDHW,
        }
    }

    pub fn rank(&self) -> usize {
        self.spatial_rank() + 2
    }

    pub fn spatial_rank(&self) -> usize {
        self.positions().spatial.len()
    }

    pub fn batch_position(&self) -> usize {
        self.positions().batch
    }

    pub fn channel_position(&self) -> usize {
        self.positions().channel
    }

    pub fn spatial_position(&self, i: usize) -> usize {
        self.positions().spatial[i]
    }

    /// Memory format of activations in this layout
    pub fn format_tag(&self) -> FormatTag {
        match self {
            DataFormat::Nhwc => FormatTag::Nhwc,
            DataFormat::Nchw => FormatTag::Nchw,
            DataFormat::Ndhwc => FormatTag::Ndhwc,
            DataFormat::Ncdhw => FormatTag::Ncdhw,
        }
    }

    /// User filter layout that goes with this rank
    pub fn filter_format(&self, grouped: bool) -> FormatTag {
        match (self.spatial_rank(), grouped) {
            (3, _) => FormatTag::Dhwio,
            (_, true) => FormatTag::Hwigo,
            _ => FormatTag::Hwio,
        }
    }

    /// Reorder a user-ordered shape into `[N, C, spatial..]`
    pub fn to_logical<T: Copy>(&self, values: &[T]) -> Vec<T> {
        let p = self.positions();
        let mut logical = Vec::with_capacity(values.len());
        logical.push(values[p.batch]);
        logical.push(values[p.channel]);
        logical.extend(p.spatial.iter().map(|&i| values[i]));
        logical
    }

    /// Inverse of [`DataFormat::to_logical`]
    pub fn from_logical<T: Copy + Default>(&self, logical: &[T]) -> Vec<T> {
        let p = self.positions();
        let mut values = vec![T::default(); logical.len()];
        values[p.batch] = logical[0];
        values[p.channel] = logical[1];
        for (i, &pos) in p.spatial.iter().enumerate() {
            values[pos] = logical[2 + i];
        }
        values
    }

    /// Batch and channel entries of a user-ordered attribute list
    pub fn batch_and_channel<T: Copy>(&self, values: &[T]) -> (T, T) {
        let p = self.positions();
        (values[p.batch], values[p.channel])
    }

    /// Slots of a flattened padding list holding spatial dim `i`
    pub fn pad_slots(&self, i: usize) -> (usize, usize) {
        let p = self.spatial_position(i);
        (2 * p, 2 * p + 1)
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataFormat::Nhwc => "NHWC",
            DataFormat::Nchw => "NCHW",
            DataFormat::Ndhwc => "NDHWC",
            DataFormat::Ncdhw => "NCDHW",
        };
        f.write_str(name)
    }
}

/// Explicit per-spatial-dim padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadAmounts {
    pub before: Vec<usize>,
    pub after: Vec<usize>,
}

impl PadAmounts {
    /// Read the spatial pads from a flattened layout-ordered list
    /// (`[n_before, n_after, h_before, h_after, ...]` for NHWC).
    pub fn from_layout_list(format: DataFormat, values: &[i64]) -> ForgeResult<Self> {
        ensure_addressable("paddings", 2 * format.rank(), values.len())?;
        let mut before = Vec::with_capacity(format.spatial_rank());
        let mut after = Vec::with_capacity(format.spatial_rank());
        for i in 0..format.spatial_rank() {
            let (b, a) = format.pad_slots(i);
            before.push(non_negative(values[b])?);
            after.push(non_negative(values[a])?);
        }
        Ok(Self { before, after })
    }

    pub fn is_zero(&self) -> bool {
        self.before.iter().chain(&self.after).all(|&p| p == 0)
    }
}

fn non_negative(value: i64) -> ForgeResult<usize> {
    usize::try_from(value)
        .map_err(|_| ForgeError::ShapeMismatch(format!("padding must be non-negative, got {}", value)))
}
