//! Memory descriptors and layout conversion
//!
//! - [`FormatTag`] / [`DType`] - layout and element type tags
//! - [`MemoryDesc`] - dims + dtype + format, also used as a buffer fingerprint
//! - [`reorder`] - permutation copy between two layouts

pub mod desc;
pub mod format;
pub mod reorder;

pub use desc::MemoryDesc;
pub use format::{DType, FormatTag};
pub use reorder::reorder;
