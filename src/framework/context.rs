//! Per-call interface between a kernel and the host framework.

use super::tensor::Tensor;
use crate::error::{checked_element_count, ForgeError, ForgeResult};

/// What a kernel needs from the framework during `compute`
pub trait OpKernelContext {
    fn num_inputs(&self) -> usize;

    fn input(&self, index: usize) -> ForgeResult<&Tensor>;

    /// Allocate a zero-filled f32 output
    fn allocate_output(&mut self, index: usize, shape: &[usize]) -> ForgeResult<()>;

    /// Reuse input `input`'s buffer as output `output`.
    ///
    /// Returns `Ok(false)` when the buffer is shared elsewhere or the element
    /// count differs; the caller then allocates and copies.
    fn forward_input_to_output(
        &mut self,
        input: usize,
        output: usize,
        shape: &[usize],
    ) -> ForgeResult<bool>;

    fn output_mut(&mut self, index: usize) -> ForgeResult<&mut Tensor>;

    /// Record the single failure of this call
    fn fail(&mut self, error: ForgeError);
}

/// In-memory context holding owned tensors
#[derive(Debug, Default)]
pub struct HostContext {
    inputs: Vec<Option<Tensor>>,
    outputs: Vec<Option<Tensor>>,
    status: Option<ForgeError>,
}

impl HostContext {
    pub fn new(inputs: Vec<Tensor>) -> Self {
        Self {
            inputs: inputs.into_iter().map(Some).collect(),
            outputs: Vec::new(),
            status: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_none()
    }

    pub fn status(&self) -> Option<&ForgeError> {
        self.status.as_ref()
    }

    pub fn take_status(&mut self) -> Option<ForgeError> {
        self.status.take()
    }

    pub fn output(&self, index: usize) -> Option<&Tensor> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    pub fn take_output(&mut self, index: usize) -> Option<Tensor> {
        self.outputs.get_mut(index).and_then(Option::take)
    }

    fn store_output(&mut self, index: usize, tensor: Tensor) {
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        self.outputs[index] = Some(tensor);
    }
}

impl OpKernelContext for HostContext {
    fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn input(&self, index: usize) -> ForgeResult<&Tensor> {
        match self.inputs.get(index) {
            Some(Some(tensor)) => Ok(tensor),
            Some(None) => Err(ForgeError::InvalidArgument(format!(
                "input {} was forwarded to an output",
                index
            ))),
            None => Err(ForgeError::InvalidArgument(format!(
                "input {} requested but only {} provided",
                index,
                self.inputs.len()
            ))),
        }
    }

    fn allocate_output(&mut self, index: usize, shape: &[usize]) -> ForgeResult<()> {
        self.store_output(index, Tensor::zeros(shape)?);
        Ok(())
    }

    fn forward_input_to_output(
        &mut self,
        input: usize,
        output: usize,
        shape: &[usize],
    ) -> ForgeResult<bool> {
        let candidate = self.input(input)?;
        let count = checked_element_count("forwarded output", shape)?;
        let forwardable = candidate.is_uniquely_owned()
            && candidate.as_f32().is_ok()
            && candidate.num_elements() == count;
        if !forwardable {
            return Ok(false);
        }
        let tensor = self.inputs[input]
            .take()
            .ok_or_else(|| ForgeError::Internal(format!("input {} vanished", input)))?;
        self.store_output(output, tensor.reshaped(shape)?);
        Ok(true)
    }

    fn output_mut(&mut self, index: usize) -> ForgeResult<&mut Tensor> {
        self.outputs
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| ForgeError::InvalidArgument(format!("output {} not allocated", index)))
    }

    fn fail(&mut self, error: ForgeError) {
        if self.status.is_none() {
            self.status = Some(error);
        }
    }
}
