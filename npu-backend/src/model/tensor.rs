//! Tensor nodes and the arena that owns them.
//!
//! Tensors reference each other only through [`TensorId`] indices handed out
//! by the arena; parent and shape-source relations are plain index fields
//! with no ownership implication.

use half::f16;
use tracing::debug;

use crate::{
    alloc::{DataLocation, Location, ShapeLocation},
    descriptor::{DimValues, TensorDesc},
    strides::{self, StridesRequirement},
};

use super::error::ModelError;

/// Stable index of a tensor node inside its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What role a tensor plays in the program. Fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum TensorUsage {
    Input,
    Output,
    Const,
    Intermediate,
    Temp,
}

/// How a child tensor shares its parent's memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SharedMode {
    /// The child occupies a sub-range of the parent, using the parent's
    /// strides verbatim.
    Roi,
}

#[derive(Clone, Debug)]
pub struct ViewEdge {
    pub parent: TensorId,
    pub mode: SharedMode,
    /// Byte offset of the child's first element inside the parent.
    pub offset: u64,
}

/// Blob-relative fallback locations for a dynamically-shaped tensor's
/// upper-bound dims and strides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShapeUpperBound {
    pub dims_offset: u64,
    pub strides_offset: u64,
}

/// Typed contents of a constant tensor.
#[derive(Clone, Debug)]
pub enum TensorContent {
    F16(Vec<f16>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    U8(Vec<u8>),
}

impl TensorContent {
    pub fn len(&self) -> usize {
        match self {
            TensorContent::F16(v) => v.len(),
            TensorContent::F32(v) => v.len(),
            TensorContent::I32(v) => v.len(),
            TensorContent::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single value of a scalar constant, widened to f32.
    pub fn scalar_f32(&self) -> Option<f32> {
        if self.len() != 1 {
            return None;
        }
        Some(match self {
            TensorContent::F16(v) => v[0].to_f32(),
            TensorContent::F32(v) => v[0],
            TensorContent::I32(v) => v[0] as f32,
            TensorContent::U8(v) => v[0] as f32,
        })
    }
}

/// One tensor instance in the graph.
#[derive(Debug)]
pub struct TensorNode {
    name: String,
    usage: TensorUsage,
    desc: TensorDesc,
    required_strides: StridesRequirement,
    location: DataLocation,
    shape_location: ShapeLocation,
    io_idx: Option<u32>,
    io_buffer_offset: Option<u64>,
    shape_upper_bound: Option<ShapeUpperBound>,
    parent_view: Option<ViewEdge>,
    children: Vec<TensorId>,
    shape_source: Option<TensorId>,
    content: Option<TensorContent>,
}

impl TensorNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> TensorUsage {
        self.usage
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn required_strides(&self) -> &StridesRequirement {
        &self.required_strides
    }

    pub fn location(&self) -> DataLocation {
        self.location
    }

    pub fn shape_location(&self) -> ShapeLocation {
        self.shape_location
    }

    pub fn io_idx(&self) -> Option<u32> {
        self.io_idx
    }

    pub fn io_buffer_offset(&self) -> Option<u64> {
        self.io_buffer_offset
    }

    pub fn shape_upper_bound(&self) -> Option<ShapeUpperBound> {
        self.shape_upper_bound
    }

    pub fn parent_view(&self) -> Option<&ViewEdge> {
        self.parent_view.as_ref()
    }

    pub fn children(&self) -> &[TensorId] {
        &self.children
    }

    pub fn shape_source(&self) -> Option<TensorId> {
        self.shape_source
    }

    pub fn content(&self) -> Option<&TensorContent> {
        self.content.as_ref()
    }

    /// A tensor may acquire a parent only while it has none and its usage
    /// allows aliasing.
    pub fn can_have_a_parent(&self) -> bool {
        self.parent_view.is_none() && self.usage == TensorUsage::Intermediate
    }

    /// A node with any view edge is structurally frozen: its stride
    /// requirements can no longer change.
    fn is_structurally_frozen(&self) -> bool {
        self.parent_view.is_some() || !self.children.is_empty()
    }
}

/// Control-flow decision returned by a view-traversal callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitAction {
    /// Terminate the whole walk immediately.
    Stop,
    /// Skip this node's children but keep walking elsewhere.
    SkipChildren,
    /// Visit this node's children.
    Descend,
}

/// Arena owning all tensor nodes of one program.
#[derive(Debug, Default)]
pub struct Tensors {
    nodes: Vec<TensorNode>,
}

impl Tensors {
    pub fn new() -> Tensors {
        Tensors::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TensorId> {
        (0..self.nodes.len()).map(TensorId)
    }

    pub fn node(&self, id: TensorId) -> &TensorNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: TensorId) -> &mut TensorNode {
        &mut self.nodes[id.0]
    }

    pub fn add(&mut self, name: impl Into<String>, usage: TensorUsage, desc: TensorDesc) -> TensorId {
        let id = TensorId(self.nodes.len());
        self.nodes.push(TensorNode {
            name: name.into(),
            usage,
            desc,
            required_strides: StridesRequirement::new(),
            location: DataLocation::default(),
            shape_location: ShapeLocation::default(),
            io_idx: None,
            io_buffer_offset: None,
            shape_upper_bound: None,
            parent_view: None,
            children: Vec::new(),
            shape_source: None,
            content: None,
        });
        id
    }

    pub fn add_const(
        &mut self,
        name: impl Into<String>,
        desc: TensorDesc,
        content: TensorContent,
    ) -> TensorId {
        let id = self.add(name, TensorUsage::Const, desc);
        assert_eq!(
            content.len() as u64,
            self.node(id).desc.total_elems(),
            "constant {} content length does not match its descriptor",
            self.node(id).name
        );
        self.node_mut(id).content = Some(content);
        id
    }

    /// Attach a region-of-interest view edge: `child` becomes an alias of a
    /// sub-range of `parent`, starting `offset` bytes in.
    pub fn attach_view(
        &mut self,
        child: TensorId,
        parent: TensorId,
        offset: u64,
    ) -> Result<(), ModelError> {
        if !self.node(child).can_have_a_parent() {
            return Err(ModelError::InvalidView(format!(
                "tensor {} cannot take a parent: usage is {} and parent is {}",
                self.node(child).name,
                self.node(child).usage,
                match self.node(child).parent_view {
                    Some(ref edge) => format!("already {}", self.node(edge.parent).name),
                    None => "none".to_string(),
                }
            )));
        }
        // Only backward references are representable, so parent walks cannot
        // cycle.
        if parent.0 >= child.0 {
            return Err(ModelError::InvalidView(format!(
                "tensor {} may only view a tensor created before it, got {}",
                self.node(child).name,
                self.node(parent).name
            )));
        }
        debug!(
            child = %self.node(child).name,
            parent = %self.node(parent).name,
            offset,
            "attaching region-of-interest view"
        );
        self.node_mut(child).parent_view = Some(ViewEdge {
            parent,
            mode: SharedMode::Roi,
            offset,
        });
        self.node_mut(parent).children.push(child);
        Ok(())
    }

    /// Attach a shape-source edge: `source` supplies the runtime dims and
    /// strides of `data`. Consumers read this edge one hop only, so only
    /// direct cycles need to be ruled out.
    pub fn attach_shape_source(
        &mut self,
        data: TensorId,
        source: TensorId,
    ) -> Result<(), ModelError> {
        if data == source {
            return Err(ModelError::InvalidShapeSource(format!(
                "tensor {} cannot source its shape from itself",
                self.node(data).name
            )));
        }
        if self.node(data).shape_source.is_some() {
            return Err(ModelError::InvalidShapeSource(format!(
                "tensor {} already has a shape source",
                self.node(data).name
            )));
        }
        if self.node(source).shape_source == Some(data) {
            return Err(ModelError::InvalidShapeSource(format!(
                "tensors {} and {} would source shapes from each other",
                self.node(data).name,
                self.node(source).name
            )));
        }
        self.node_mut(data).shape_source = Some(source);
        Ok(())
    }

    /// Walk parent edges up to the unique ancestor with no parent.
    pub fn top_parent(&self, id: TensorId) -> TensorId {
        let mut top = id;
        while let Some(edge) = self.node(top).parent_view() {
            top = edge.parent;
        }
        top
    }

    /// Concrete byte strides of a tensor. A region-of-interest child uses its
    /// parent's strides, recursively.
    pub fn strides(&self, id: TensorId) -> DimValues {
        if let Some(edge) = self.node(id).parent_view() {
            match edge.mode {
                SharedMode::Roi => return self.strides(edge.parent),
            }
        }
        strides::calc_strides(&self.node(id).desc, &self.node(id).required_strides)
    }

    /// Total byte size of a tensor's storage. Defined only for tensors
    /// without a parent; a child has no independent size.
    pub fn total_byte_size(&self, id: TensorId) -> u64 {
        let node = self.node(id);
        assert!(
            node.parent_view.is_none(),
            "byte size queried on {}, which aliases a parent tensor",
            node.name
        );
        let strides = self.strides(id);
        let perm = node.desc.order().to_permutation();
        let major = *perm.last().expect("descriptor has at least one dimension");
        let size = node
            .desc
            .dim(major)
            .expect("descriptor invariant: every ordered dimension has a size");
        let stride = strides
            .get(major)
            .expect("strides cover every descriptor dimension");
        stride * size
    }

    /// Byte offset of the element at `coord`.
    pub fn elem_offset(&self, id: TensorId, coord: &DimValues) -> u64 {
        let node = self.node(id);
        let strides = self.strides(id);
        let mut offset = 0;
        for (dim, value) in coord.iter() {
            assert!(
                node.desc.order().has_dim(dim),
                "coordinate names dimension {} which tensor {} does not have",
                dim,
                node.name
            );
            let size = node
                .desc
                .dim(dim)
                .expect("descriptor invariant: every ordered dimension has a size");
            assert!(
                value < size,
                "coordinate {} out of bounds for dimension {} of tensor {} (size {})",
                value,
                dim,
                node.name,
                size
            );
            offset += value
                * strides
                    .get(dim)
                    .expect("strides cover every descriptor dimension");
        }
        offset
    }

    /// Byte offset of the last element.
    pub fn last_elem_offset(&self, id: TensorId) -> u64 {
        let mut last = DimValues::new();
        for (dim, size) in self.node(id).desc.dims().iter() {
            last.set(dim, size - 1);
        }
        self.elem_offset(id, &last)
    }

    pub fn check_strides(&self, id: TensorId, reqs: &StridesRequirement) -> bool {
        strides::check_strides(&self.node(id).desc, &self.strides(id), reqs)
    }

    /// Merge `incoming` into the tensor's stride requirements.
    ///
    /// Illegal once any view edge exists on the node. The merged result must
    /// satisfy both the previous and the incoming requirement; a violation
    /// means two operations pinned conflicting strides onto the same tensor
    /// and is a fatal internal failure.
    pub fn update_required_strides(&mut self, id: TensorId, incoming: &StridesRequirement) {
        let node = self.node(id);
        assert!(
            !node.is_structurally_frozen(),
            "stride requirements of {} cannot change once view edges exist",
            node.name
        );

        let previous = node.required_strides.clone();
        let merged = strides::merge(&previous, incoming);
        self.node_mut(id).required_strides = merged;

        assert!(
            self.check_strides(id, &previous),
            "merged stride requirements of {} no longer satisfy the previous requirement",
            self.node(id).name
        );
        assert!(
            self.check_strides(id, incoming),
            "merged stride requirements of {} do not satisfy the incoming requirement",
            self.node(id).name
        );
    }

    pub fn set_io_index(&mut self, id: TensorId, io_idx: u32) {
        self.node_mut(id).io_idx = Some(io_idx);
    }

    /// Record the placement of an input or output tensor. The location must
    /// match the tensor's usage; anything else is an internal bug.
    pub fn set_io_info(&mut self, id: TensorId, location: Location, io_buffer_offset: u64) {
        let node = self.node(id);
        match node.usage {
            TensorUsage::Input => assert!(
                location == Location::Input,
                "input tensor {} placed in {}",
                node.name,
                location
            ),
            TensorUsage::Output => assert!(
                location == Location::Output,
                "output tensor {} placed in {}",
                node.name,
                location
            ),
            usage => panic!(
                "set_io_info called for {} whose usage is {}",
                node.name, usage
            ),
        }
        let node = self.node_mut(id);
        node.location = DataLocation { location, offset: 0 };
        node.io_buffer_offset = Some(io_buffer_offset);
    }

    /// Record the placement of a Const, Intermediate or Temp tensor.
    pub fn set_data_allocation_info(&mut self, id: TensorId, location: DataLocation) {
        let node = self.node(id);
        match node.usage {
            TensorUsage::Const => assert!(
                location.location == Location::Blob,
                "const tensor {} placed in {}, only the constant pool is valid",
                node.name,
                location.location
            ),
            TensorUsage::Temp => assert!(
                location.location == Location::Bss,
                "temp tensor {} placed in {}, only zero-init scratch is valid",
                node.name,
                location.location
            ),
            TensorUsage::Intermediate => {}
            usage => panic!(
                "set_data_allocation_info called for {} whose usage is {}",
                node.name, usage
            ),
        }
        self.node_mut(id).location = location;
    }

    pub fn set_shape_allocation_info(&mut self, id: TensorId, shape_location: ShapeLocation) {
        self.node_mut(id).shape_location = shape_location;
    }

    pub fn set_shape_upper_bound(&mut self, id: TensorId, upper_bound: ShapeUpperBound) {
        self.node_mut(id).shape_upper_bound = Some(upper_bound);
    }

    pub fn is_shape_allocated(&self, id: TensorId) -> bool {
        self.node(id).shape_location != ShapeLocation::default()
    }

    /// Forget a tensor's placement so it can be re-derived after an error.
    pub fn clear_allocation(&mut self, id: TensorId) {
        let node = self.node_mut(id);
        node.location = DataLocation::default();
        node.io_buffer_offset = None;
    }

    /// Depth-first walk over a tensor and its view children. The callback
    /// decides per visit whether to descend, skip the children, or stop the
    /// whole walk.
    pub fn for_each_view<F>(&self, root: TensorId, f: &mut F)
    where
        F: FnMut(TensorId) -> VisitAction,
    {
        match f(root) {
            VisitAction::Descend => {
                self.walk_children(root, f);
            }
            VisitAction::Stop | VisitAction::SkipChildren => {}
        }
    }

    fn walk_children<F>(&self, id: TensorId, f: &mut F) -> VisitAction
    where
        F: FnMut(TensorId) -> VisitAction,
    {
        for &child in self.node(id).children() {
            match f(child) {
                VisitAction::Descend => {
                    if self.walk_children(child, f) == VisitAction::Stop {
                        return VisitAction::Stop;
                    }
                }
                VisitAction::SkipChildren => {}
                VisitAction::Stop => return VisitAction::Stop,
            }
        }
        VisitAction::Descend
    }
}
