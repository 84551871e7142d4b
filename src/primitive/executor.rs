//! Primitive execution with scoped argument binding.

use super::{ArgRole, Primitive, SlotTable};
use crate::error::{ensure_addressable, ForgeError, ForgeResult};
use std::panic::{self, AssertUnwindSafe};
use tracing::trace;

/// Read-only buffers handed to one execution
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecArgs<'a> {
    pub src: Option<&'a [f32]>,
    pub weights: Option<&'a [f32]>,
    pub bias: Option<&'a [f32]>,
    pub diff_dst: Option<&'a [f32]>,
}

impl<'a> ExecArgs<'a> {
    pub fn forward(src: &'a [f32], weights: &'a [f32], bias: Option<&'a [f32]>) -> Self {
        Self {
            src: Some(src),
            weights: Some(weights),
            bias,
            diff_dst: None,
        }
    }

    pub fn backward_data(diff_dst: &'a [f32], weights: &'a [f32]) -> Self {
        Self {
            weights: Some(weights),
            diff_dst: Some(diff_dst),
            ..Self::default()
        }
    }

    pub fn backward_weights(src: &'a [f32], diff_dst: &'a [f32]) -> Self {
        Self {
            src: Some(src),
            diff_dst: Some(diff_dst),
            ..Self::default()
        }
    }

    pub fn get(&self, role: ArgRole) -> Option<&'a [f32]> {
        match role {
            ArgRole::Src => self.src,
            ArgRole::Weights => self.weights,
            ArgRole::Bias => self.bias,
            ArgRole::DiffDst => self.diff_dst,
            ArgRole::Dst => None,
        }
    }

    /// Buffer for a role the primitive cannot run without
    pub fn require(&self, role: ArgRole) -> ForgeResult<&'a [f32]> {
        self.get(role).ok_or_else(|| {
            ForgeError::InvalidArgument(format!("missing {} buffer", role.name()))
        })
    }
}

/// Resets every slot when dropped, whatever way the execution ends
struct SlotBinding<'a> {
    table: &'a mut SlotTable,
}

impl Drop for SlotBinding<'_> {
    fn drop(&mut self) {
        self.table.reset();
    }
}

/// Bind `args` and `dst` into `primitive`'s slots, run it, unbind.
pub fn execute(primitive: &Primitive, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
    let descs = primitive.descs();
    for role in ArgRole::ALL {
        let Some(desc) = descs.get(role) else {
            if args.get(role).is_some() {
                return Err(ForgeError::InvalidArgument(format!(
                    "{} buffer passed to a {} primitive that takes none",
                    role.name(),
                    primitive.descriptor().kind.name()
                )));
            }
            continue;
        };
        let available = match role {
            ArgRole::Dst => dst.len(),
            _ => args.require(role)?.len(),
        };
        ensure_addressable(role.name(), desc.element_count(), available)?;
    }

    let mut slots = primitive.slots.lock()?;
    let binding = SlotBinding { table: &mut slots };
    for role in ArgRole::ALL {
        if let Some(data) = args.get(role) {
            binding.table.bind(role, data);
        }
    }
    binding.table.bind(ArgRole::Dst, dst);
    trace!(
        kind = primitive.descriptor().kind.name(),
        bound = binding.table.bound_count(),
        "executing primitive"
    );

    primitive.record_execution();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| primitive.kernel().run(args, dst)));
    drop(binding);

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(ForgeError::ExecutionAborted(panic_message(payload.as_ref()))),
    }
}

impl Primitive {
    /// See [`execute`]
    pub fn execute(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()> {
        execute(self, args, dst)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "primitive panicked".to_string()
    }
}
