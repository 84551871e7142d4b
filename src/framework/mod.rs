//! Framework-facing types: attributes, tensors and the per-call context.

pub mod attrs;
pub mod context;
pub mod tensor;

pub use attrs::{AttrMap, AttrValue};
pub use context::{HostContext, OpKernelContext};
pub use tensor::{Tensor, TensorData};
