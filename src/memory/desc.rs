//! Memory descriptors: logical dims + element type + physical layout.

use super::format::{DType, FormatTag};
use crate::error::{checked_element_count, ForgeError, ForgeResult};
use std::fmt;

/// One physical layout of a logical tensor.
///
/// `dims` are always in canonical logical order; `format` says how they are
/// laid out in memory. Two descriptors are equal only if all three agree, so
/// a descriptor doubles as the fingerprint of a reordered buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    dtype: DType,
    format: FormatTag,
}

impl MemoryDesc {
    pub fn new(dims: Vec<usize>, dtype: DType, format: FormatTag) -> ForgeResult<Self> {
        if let Some(rank) = format.rank() {
            if rank != dims.len() {
                return Err(ForgeError::ShapeMismatch(format!(
                    "format {} expects {} dims, got {:?}",
                    format, rank, dims
                )));
            }
        }
        checked_element_count("memory descriptor", &dims)?;
        Ok(Self { dims, dtype, format })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    /// Bounded by construction
    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// False while the format is still `Any`
    pub fn is_resolved(&self) -> bool {
        self.format != FormatTag::Any
    }

    /// Same logical tensor in another layout
    pub fn with_format(&self, format: FormatTag) -> ForgeResult<Self> {
        Self::new(self.dims.clone(), self.dtype, format)
    }

    /// Element strides indexed by logical dimension
    pub fn strides(&self) -> ForgeResult<Vec<usize>> {
        let order = self.format.physical_order().ok_or_else(|| {
            ForgeError::Internal("strides requested for an unresolved memory format".to_string())
        })?;
        let mut strides = vec![0usize; self.dims.len()];
        let mut stride = 1usize;
        for &axis in order.iter().rev() {
            strides[axis] = stride;
            stride = stride.saturating_mul(self.dims[axis]);
        }
        Ok(strides)
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{:?}", self.dtype, self.format, self.dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_checked() {
        assert!(MemoryDesc::new(vec![1, 2, 3, 4], DType::F32, FormatTag::Nhwc).is_ok());
        let err = MemoryDesc::new(vec![1, 2, 3], DType::F32, FormatTag::Nhwc).unwrap_err();
        assert!(matches!(err, ForgeError::ShapeMismatch(_)));
        // Any accepts every rank
        assert!(MemoryDesc::new(vec![5, 7], DType::F32, FormatTag::Any).is_ok());
    }

    #[test]
    fn test_overflowing_dims_rejected() {
        let huge = usize::MAX / 2;
        let err = MemoryDesc::new(vec![huge, 4], DType::F32, FormatTag::Oi).unwrap_err();
        assert!(matches!(err, ForgeError::ShapeMismatch(_)));
    }

    #[test]
    fn test_strides_nchw_vs_nhwc() {
        let nchw = MemoryDesc::new(vec![2, 3, 4, 5], DType::F32, FormatTag::Nchw).unwrap();
        assert_eq!(nchw.strides().unwrap(), vec![60, 20, 5, 1]);

        let nhwc = nchw.with_format(FormatTag::Nhwc).unwrap();
        assert_eq!(nhwc.strides().unwrap(), vec![60, 1, 15, 3]);
    }

    #[test]
    fn test_strides_hwio() {
        // logical [O=4, I=3, H=2, W=2]
        let hwio = MemoryDesc::new(vec![4, 3, 2, 2], DType::F32, FormatTag::Hwio).unwrap();
        assert_eq!(hwio.strides().unwrap(), vec![1, 4, 24, 12]);
    }

    #[test]
    fn test_unresolved_has_no_strides() {
        let any = MemoryDesc::new(vec![4, 3], DType::F32, FormatTag::Any).unwrap();
        assert!(!any.is_resolved());
        assert!(any.strides().is_err());
    }

    #[test]
    fn test_fingerprint_equality() {
        let a = MemoryDesc::new(vec![4, 3], DType::F32, FormatTag::Oi).unwrap();
        let b = MemoryDesc::new(vec![4, 3], DType::F32, FormatTag::Io).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, b.with_format(FormatTag::Oi).unwrap());
        assert_eq!(a.to_string(), "f32:oi[4, 3]");
    }
}
