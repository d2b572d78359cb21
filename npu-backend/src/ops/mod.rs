//! The contract every graph operation implements to report its layout,
//! placement and resource needs and to emit its own encoding.

use std::fmt::Debug;

use crate::{
    descriptor::DimsOrder,
    model::{OpIo, Tensors},
    serialize::BlobWriter,
    strides::StridesRequirement,
};

pub use error::OpError;
mod error;
pub mod nms;

/// Whether an operation needs every parallel compute lane to itself or can
/// run on a single one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeNeed {
    NeedsAll,
    NeedsOne,
}

/// Whether an operation can be replicated over an outer batch dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchSupport {
    Split,
}

/// Per-edge answers an operation hands back from a hook, one optional slot
/// per input and output.
#[derive(Clone, Debug)]
pub struct EdgeInfo<T> {
    inputs: Vec<Option<T>>,
    outputs: Vec<Option<T>>,
}

impl<T> EdgeInfo<T> {
    pub fn for_io(io: &OpIo) -> EdgeInfo<T> {
        EdgeInfo {
            inputs: (0..io.inputs.len()).map(|_| None).collect(),
            outputs: (0..io.outputs.len()).map(|_| None).collect(),
        }
    }

    pub fn set_input(&mut self, idx: usize, value: T) {
        self.inputs[idx] = Some(value);
    }

    pub fn set_output(&mut self, idx: usize, value: T) {
        self.outputs[idx] = Some(value);
    }

    pub fn input(&self, idx: usize) -> Option<&T> {
        self.inputs[idx].as_ref()
    }

    pub fn output(&self, idx: usize) -> Option<&T> {
        self.outputs[idx].as_ref()
    }

    pub fn iter_inputs(&self) -> impl Iterator<Item = (usize, &T)> {
        self.inputs
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.as_ref().map(|v| (idx, v)))
    }

    pub fn iter_outputs(&self) -> impl Iterator<Item = (usize, &T)> {
        self.outputs
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.as_ref().map(|v| (idx, v)))
    }
}

/// Dimension-order requests per edge.
pub type OrderInfo = EdgeInfo<DimsOrder>;
/// Stride requirements per edge, fed into the planner's merge.
pub type StridesInfo = EdgeInfo<StridesRequirement>;
/// Batch replication support per edge.
pub type BatchInfo = EdgeInfo<BatchSupport>;

/// The polymorphic operation contract.
///
/// The pass driver invokes the hooks in a fixed order: `propagate_layout`,
/// `report_stride_requirements`, placement assignment, `finalize_layout`,
/// `validate`, the resource queries, then `emit_parameters` and
/// `emit_operands`. Layout hooks default to no-ops; accepting whatever
/// upstream produces is a valid answer.
pub trait GraphOp: Debug {
    /// Name of this operation instance, used in diagnostics.
    fn name(&self) -> &str;

    /// Request a specific dimension order per input/output.
    fn propagate_layout(&self, _io: &OpIo, _tensors: &Tensors, _orders: &mut OrderInfo) {}

    /// Request per-tensor stride constraints.
    fn report_stride_requirements(&self, _io: &OpIo, _tensors: &Tensors, _strides: &mut StridesInfo) {
    }

    /// Called once placement and order are fixed; last chance to record
    /// derived per-operation state.
    fn finalize_layout(&mut self, _io: &OpIo, _tensors: &Tensors) {}

    /// Declare batch replication support.
    fn report_batch_support(&self, _io: &OpIo, _batch: &mut BatchInfo) {}

    /// Declare compute-lane demand.
    fn compute_resource_need(&self, _io: &OpIo, _tensors: &Tensors) -> ComputeNeed {
        ComputeNeed::NeedsOne
    }

    /// Check the operation's type/shape/usage preconditions.
    fn validate(&self, io: &OpIo, tensors: &Tensors) -> Result<(), OpError>;

    /// Append the operation's fixed-format parameters to the blob.
    fn emit_parameters(&self, io: &OpIo, writer: &mut BlobWriter);

    /// Append the operation's operand records to the blob, in declared order.
    fn emit_operands(&self, io: &OpIo, tensors: &Tensors, writer: &mut BlobWriter);
}
