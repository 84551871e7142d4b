//! Convolution attribute validation and descriptor building
//!
//! - [`layout`] - data formats and their dimension position tables
//! - [`validate`] - construction-time attribute checks
//! - [`descriptor`] - output sizes and primitive descriptors

pub mod descriptor;
pub mod layout;
pub mod validate;

pub use descriptor::{
    plan_forward, windowed_output_size, ConvForwardPlan, ConvForwardRequest, ConvPlan,
    ConvShapes, PadSpec, SpatialExtent,
};
pub use layout::{DataFormat, PadAmounts};
pub use validate::{validate_conv_attrs, ConvAttrs, Padding, RawConvAttrs};
