//! Layout conversion between two descriptors of the same logical tensor.

use super::desc::MemoryDesc;
use crate::error::{ensure_addressable, ForgeError, ForgeResult};

/// Copy `src` (laid out per `from`) into a fresh buffer laid out per `to`.
pub fn reorder(src: &[f32], from: &MemoryDesc, to: &MemoryDesc) -> ForgeResult<Vec<f32>> {
    if from.dims() != to.dims() {
        return Err(ForgeError::ShapeMismatch(format!(
            "cannot reorder {} into {}: logical dims differ",
            from, to
        )));
    }
    let count = from.element_count();
    ensure_addressable("reorder source", count, src.len())?;

    let from_strides = from.strides()?;
    let to_strides = to.strides()?;
    if from_strides == to_strides {
        return Ok(src[..count].to_vec());
    }

    let dims = from.dims();
    let rank = dims.len();
    let mut dst = vec![0.0f32; count];
    let mut index = vec![0usize; rank];
    for _ in 0..count {
        let mut src_off = 0;
        let mut dst_off = 0;
        for axis in 0..rank {
            src_off += index[axis] * from_strides[axis];
            dst_off += index[axis] * to_strides[axis];
        }
        dst[dst_off] = src[src_off];

        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(dst)
}
