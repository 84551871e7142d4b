//! Backend primitives and their lifecycle
//!
//! - [`Primitive`] - compiled compute plan with argument slots
//! - [`executor`] - binds buffers, runs, always unbinds
//! - [`cache`] - descriptor-keyed primitive cache

pub mod cache;
pub mod executor;

pub use cache::PrimitiveCache;
pub use executor::{execute, ExecArgs};

use crate::descriptor::OperationDescriptor;
use crate::error::ForgeResult;
use crate::memory::MemoryDesc;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Compute body of a primitive, supplied by a backend
pub trait PrimitiveKernel: Send + Sync + fmt::Debug {
    /// Run once over bound buffers. Buffers were already checked against
    /// the primitive's memory descriptors.
    fn run(&self, args: &ExecArgs<'_>, dst: &mut [f32]) -> ForgeResult<()>;
}

/// Argument roles of a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRole {
    Src,
    Weights,
    Bias,
    DiffDst,
    /// Result: destination, diff-src or diff-weights depending on the kind
    Dst,
}

impl ArgRole {
    pub const ALL: [ArgRole; 5] = [
        ArgRole::Src,
        ArgRole::Weights,
        ArgRole::Bias,
        ArgRole::DiffDst,
        ArgRole::Dst,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ArgRole::Src => "src",
            ArgRole::Weights => "weights",
            ArgRole::Bias => "bias",
            ArgRole::DiffDst => "diff_dst",
            ArgRole::Dst => "dst",
        }
    }

    fn index(&self) -> usize {
        match self {
            ArgRole::Src => 0,
            ArgRole::Weights => 1,
            ArgRole::Bias => 2,
            ArgRole::DiffDst => 3,
            ArgRole::Dst => 4,
        }
    }
}

/// Resolved memory descriptor per argument role
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDescs {
    pub src: Option<MemoryDesc>,
    pub weights: Option<MemoryDesc>,
    pub bias: Option<MemoryDesc>,
    pub diff_dst: Option<MemoryDesc>,
    pub dst: MemoryDesc,
}

impl ArgDescs {
    pub fn get(&self, role: ArgRole) -> Option<&MemoryDesc> {
        match role {
            ArgRole::Src => self.src.as_ref(),
            ArgRole::Weights => self.weights.as_ref(),
            ArgRole::Bias => self.bias.as_ref(),
            ArgRole::DiffDst => self.diff_dst.as_ref(),
            ArgRole::Dst => Some(&self.dst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SlotState {
    #[default]
    Unbound,
    Bound { addr: usize, len: usize },
}

/// Buffers currently attached to a primitive
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: [SlotState; 5],
}

impl SlotTable {
    pub(crate) fn bind(&mut self, role: ArgRole, data: &[f32]) {
        self.slots[role.index()] = SlotState::Bound {
            addr: data.as_ptr() as usize,
            len: data.len(),
        };
    }

    pub(crate) fn reset(&mut self) {
        self.slots = [SlotState::Unbound; 5];
    }

    pub(crate) fn bound_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotState::Bound { .. }))
            .count()
    }
}

/// Backend-built compute plan.
///
/// Immutable apart from its argument slots, which are bound for the duration
/// of one execution. Executions on one handle are serialized by the slot
/// lock; the handle is shared through `Arc` by every caller whose descriptor
/// compares equal.
#[derive(Debug)]
pub struct Primitive {
    descriptor: OperationDescriptor,
    descs: ArgDescs,
    kernel: Box<dyn PrimitiveKernel>,
    pub(crate) slots: Mutex<SlotTable>,
    executions: AtomicU64,
}

impl Primitive {
    pub fn new(descriptor: OperationDescriptor, descs: ArgDescs, kernel: Box<dyn PrimitiveKernel>) -> Self {
        Self {
            descriptor,
            descs,
            kernel,
            slots: Mutex::new(SlotTable::default()),
            executions: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    pub fn descs(&self) -> &ArgDescs {
        &self.descs
    }

    /// Layout the primitive expects its weights in
    pub fn weights_desc(&self) -> Option<&MemoryDesc> {
        self.descs.weights.as_ref()
    }

    pub fn src_desc(&self) -> Option<&MemoryDesc> {
        self.descs.src.as_ref()
    }

    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.descs.dst
    }

    /// Completed or attempted executions
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Slots currently bound; zero whenever no execution is in flight
    pub fn bound_slot_count(&self) -> ForgeResult<usize> {
        Ok(self.slots.lock()?.bound_count())
    }

    pub(crate) fn kernel(&self) -> &dyn PrimitiveKernel {
        self.kernel.as_ref()
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }
}
