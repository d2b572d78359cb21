//! Memory-layout and code-emission backend for an embedded neural
//! accelerator.
//!
//! Given a graph of tensors and operations, this crate decides storage
//! layout (dimension order, strides) and physical placement (memory region,
//! byte offset) for every tensor, lets each operation declare its layout and
//! resource constraints, and serializes the finalized graph into the binary
//! blob consumed by the device-side loader.
//!
//! The graph frontend, the full pass scheduler and the device runtime live
//! outside this crate; they interact with it through [`model::Model`], the
//! [`ops::GraphOp`] contract and the [`serialize`] records.

pub mod alloc;
pub mod descriptor;
pub mod model;
pub mod ops;
pub mod pipeline;
pub mod serialize;
pub mod strides;
pub mod testing;

pub use alloc::{Allocator, DataLocation, Location, Resources, ShapeLocation};
pub use descriptor::{Dim, DimValues, DimsOrder, ElemType, TensorDesc};
pub use model::{Model, ModelError, OpId, OpIo, TensorId, TensorUsage, VisitAction};
pub use ops::{ComputeNeed, GraphOp, OpError};
pub use serialize::BlobWriter;
