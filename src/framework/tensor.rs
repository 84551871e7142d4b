//! Host tensors exchanged with the framework collaborator.

use crate::error::{checked_element_count, ForgeError, ForgeResult};
use crate::memory::DType;
use std::sync::Arc;

/// Shared element storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<Vec<f32>>),
    I32(Arc<Vec<i32>>),
}

/// Dense tensor in its user layout (row-major over `shape`)
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> ForgeResult<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: TensorData::F32(Arc::new(data)),
        })
    }

    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> ForgeResult<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: TensorData::I32(Arc::new(data)),
        })
    }

    /// Zero-filled f32 tensor.
    ///
    /// The element count is checked and the buffer reserved fallibly, so an
    /// absurd shape is an error rather than an abort.
    pub fn zeros(shape: &[usize]) -> ForgeResult<Self> {
        let count = checked_element_count("tensor", shape)?;
        let mut data = Vec::new();
        data.try_reserve_exact(count)
            .map_err(|_| ForgeError::AllocationFailed {
                what: format!("tensor {:?}", shape),
                elements: count,
            })?;
        data.resize(count, 0.0);
        Ok(Self {
            shape: shape.to_vec(),
            data: TensorData::F32(Arc::new(data)),
        })
    }

    /// 1-D int32 vector, the form of shape-carrying inputs
    pub fn vector_i32(values: &[i32]) -> Self {
        Self {
            shape: vec![values.len()],
            data: TensorData::I32(Arc::new(values.to_vec())),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the backing buffer, which construction ties to the shape
    pub fn num_elements(&self) -> usize {
        match &self.data {
            TensorData::F32(data) => data.len(),
            TensorData::I32(data) => data.len(),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
        }
    }

    pub fn as_f32(&self) -> ForgeResult<&[f32]> {
        match &self.data {
            TensorData::F32(data) => Ok(data.as_slice()),
            TensorData::I32(_) => Err(dtype_error(DType::F32, DType::I32)),
        }
    }

    pub fn as_i32(&self) -> ForgeResult<&[i32]> {
        match &self.data {
            TensorData::I32(data) => Ok(data.as_slice()),
            TensorData::F32(_) => Err(dtype_error(DType::I32, DType::F32)),
        }
    }

    /// Mutable view; copies the buffer first if it is shared
    pub fn as_f32_mut(&mut self) -> ForgeResult<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(data) => Ok(Arc::make_mut(data).as_mut_slice()),
            TensorData::I32(_) => Err(dtype_error(DType::F32, DType::I32)),
        }
    }

    /// True if no other tensor shares this buffer
    pub fn is_uniquely_owned(&self) -> bool {
        match &self.data {
            TensorData::F32(data) => Arc::strong_count(data) == 1,
            TensorData::I32(data) => Arc::strong_count(data) == 1,
        }
    }

    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        match (&self.data, &other.data) {
            (TensorData::F32(a), TensorData::F32(b)) => Arc::ptr_eq(a, b),
            (TensorData::I32(a), TensorData::I32(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Same buffer under a new shape with the same element count
    pub fn reshaped(self, shape: &[usize]) -> ForgeResult<Self> {
        let count = checked_element_count("reshape target", shape)?;
        if count != self.num_elements() {
            return Err(ForgeError::ShapeMismatch(format!(
                "cannot view {:?} as {:?}",
                self.shape, shape
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: self.data,
        })
    }
}

fn check_len(shape: &[usize], len: usize) -> ForgeResult<()> {
    let count = checked_element_count("tensor", shape)?;
    if count != len {
        return Err(ForgeError::ShapeMismatch(format!(
            "shape {:?} holds {} elements, got {}",
            shape, count, len
        )));
    }
    Ok(())
}

fn dtype_error(expected: DType, actual: DType) -> ForgeError {
    ForgeError::InvalidArgument(format!("expected a {} tensor, got {}", expected, actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_checks_length() {
        assert!(Tensor::from_f32(vec![2, 2], vec![0.0; 4]).is_ok());
        assert!(matches!(
            Tensor::from_f32(vec![2, 2], vec![0.0; 3]),
            Err(ForgeError::ShapeMismatch(_))
        ));
        assert_eq!(Tensor::zeros(&[0, 3]).unwrap().num_elements(), 0);
    }

    #[test]
    fn test_overflowing_shapes_are_errors() {
        let huge = i32::MAX as usize;
        let shape = [huge, huge, huge, huge];
        assert!(matches!(Tensor::zeros(&shape), Err(ForgeError::ShapeMismatch(_))));
        assert!(matches!(
            Tensor::from_f32(shape.to_vec(), vec![]),
            Err(ForgeError::ShapeMismatch(_))
        ));
        let t = Tensor::from_f32(vec![1], vec![1.0]).unwrap();
        assert!(matches!(t.reshaped(&shape), Err(ForgeError::ShapeMismatch(_))));
    }

    #[test]
    fn test_dtype_views() {
        let t = Tensor::vector_i32(&[1, 2, 3, 4]);
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.as_i32().unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(t.as_f32(), Err(ForgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_sharing_and_copy_on_write() {
        let a = Tensor::from_f32(vec![2], vec![1.0, 2.0]).unwrap();
        assert!(a.is_uniquely_owned());

        let mut b = a.clone();
        assert!(!a.is_uniquely_owned());
        assert!(a.shares_buffer_with(&b));

        b.as_f32_mut().unwrap()[0] = 9.0;
        assert!(!a.shares_buffer_with(&b));
        assert_eq!(a.as_f32().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_reshaped() {
        let t = Tensor::zeros(&[2, 3]).unwrap();
        assert_eq!(t.clone().reshaped(&[3, 2]).unwrap().shape(), &[3, 2]);
        assert!(t.reshaped(&[4]).is_err());
    }
}
