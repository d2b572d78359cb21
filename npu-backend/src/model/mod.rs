//! The program graph: an arena of tensor nodes plus the operations that
//! connect them. The graph owns everything; nodes refer to each other only
//! through arena indices.

mod error;
mod tensor;

pub use error::ModelError;
pub use tensor::{
    SharedMode, ShapeUpperBound, TensorContent, TensorId, TensorNode, TensorUsage, Tensors,
    ViewEdge, VisitAction,
};

use crate::{descriptor::TensorDesc, ops::GraphOp};

/// Stable index of an operation node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) usize);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tensors an operation touches, in declared order.
#[derive(Clone, Debug, Default)]
pub struct OpIo {
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Scratch tensors attached to this operation (e.g. a DDR fallback
    /// buffer), not part of the operation's dataflow signature.
    pub temps: Vec<TensorId>,
}

/// One operation node: the polymorphic operation plus its tensor lists.
#[derive(Debug)]
pub struct OpNode {
    pub operation: Box<dyn GraphOp>,
    pub io: OpIo,
}

/// A whole program graph under compilation.
#[derive(Debug, Default)]
pub struct Model {
    tensors: Tensors,
    ops: Vec<OpNode>,
}

impl Model {
    pub fn new() -> Model {
        Model::default()
    }

    pub fn tensors(&self) -> &Tensors {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut Tensors {
        &mut self.tensors
    }

    pub fn ops(&self) -> &[OpNode] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> &OpNode {
        &self.ops[id.0]
    }

    /// Split borrow so op hooks can run against the tensor arena.
    pub fn parts_mut(&mut self) -> (&mut Tensors, &mut [OpNode]) {
        (&mut self.tensors, &mut self.ops)
    }

    pub fn add_op(
        &mut self,
        operation: Box<dyn GraphOp>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(OpNode {
            operation,
            io: OpIo {
                inputs,
                outputs,
                temps: Vec::new(),
            },
        });
        id
    }

    /// Create a zero-initialized scratch tensor and attach it to `op` as a
    /// temp-buffer dependency.
    pub fn add_temp_buffer(&mut self, op: OpId, desc: TensorDesc) -> TensorId {
        let name = format!("{}:scratch{}", self.ops[op.0].operation.name(), self.ops[op.0].io.temps.len());
        let id = self.tensors.add(name, TensorUsage::Temp, desc);
        self.ops[op.0].io.temps.push(id);
        id
    }

    /// Input tensors followed by output tensors, in creation order. This is
    /// the I/O directory order used at serialization time.
    pub fn io_tensors(&self) -> Vec<TensorId> {
        let inputs = self
            .tensors
            .ids()
            .filter(|id| self.tensors.node(*id).usage() == TensorUsage::Input);
        let outputs = self
            .tensors
            .ids()
            .filter(|id| self.tensors.node(*id).usage() == TensorUsage::Output);
        inputs.chain(outputs).collect()
    }
}
