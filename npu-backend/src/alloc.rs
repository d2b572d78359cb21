//! Physical placement: memory regions, the linear region allocator and the
//! on-chip scratch feasibility test.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, warn};

use crate::model::{TensorId, TensorUsage, Tensors};

/// Byte alignment of every data placement.
pub const DATA_ALIGNMENT: u64 = 64;

/// Default on-chip scratch capacity, overridable via `NPU_ON_CHIP_CAPACITY`.
pub static ON_CHIP_CAPACITY: Lazy<u64> = Lazy::new(|| {
    env::var("NPU_ON_CHIP_CAPACITY")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(128 * 1024)
});

/// Default compute-lane count, overridable via `NPU_COMPUTE_LANES`. Each lane
/// also contributes one on-chip scratch partition.
pub static COMPUTE_LANES: Lazy<u32> = Lazy::new(|| {
    env::var("NPU_COMPUTE_LANES")
        .ok()
        .and_then(|val| val.parse::<u32>().ok())
        .unwrap_or(8)
});

/// Memory region a tensor can live in. The discriminants are the region
/// codes of the serialized format and must not change independently of the
/// device-side loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[repr(u32)]
pub enum Location {
    /// No placement assigned yet.
    None = 0,
    Input = 1,
    Output = 2,
    /// Constant pool inside the emitted blob.
    Blob = 3,
    /// Zero-initialized scratch.
    Bss = 4,
    /// General memory.
    Ddr = 5,
    /// Capacity-limited scratch local to the compute engine.
    OnChip = 6,
}

impl Location {
    pub fn wire_code(&self) -> u32 {
        *self as u32
    }
}

/// Where a tensor's bytes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLocation {
    pub location: Location,
    pub offset: u64,
}

impl Default for DataLocation {
    fn default() -> DataLocation {
        DataLocation {
            location: Location::None,
            offset: 0,
        }
    }
}

/// Where a tensor's dimension sizes and strides live. Resolved independently
/// of the data placement: a dynamically-shaped tensor keeps its real dims in
/// runtime memory while an upper-bound copy sits in the constant pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeLocation {
    pub dims_location: Location,
    pub dims_offset: u64,
    pub strides_location: Location,
    pub strides_offset: u64,
}

impl Default for ShapeLocation {
    fn default() -> ShapeLocation {
        ShapeLocation {
            dims_location: Location::None,
            dims_offset: 0,
            strides_location: Location::None,
            strides_offset: 0,
        }
    }
}

/// Hardware resource description of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub on_chip_capacity: u64,
    pub compute_lanes: u32,
}

impl Default for Resources {
    fn default() -> Resources {
        Resources {
            on_chip_capacity: *ON_CHIP_CAPACITY,
            compute_lanes: *COMPUTE_LANES,
        }
    }
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Decide whether `sizes` can be packed into on-chip scratch.
///
/// `extra_partitions` is the number of partitions available beyond the first.
/// Buffers are placed in order at a running offset; a buffer that does not
/// fit rolls over to a fresh partition if any remain. Comparisons are strict,
/// so a buffer exactly filling the remaining capacity rolls over too.
pub fn scratch_fits(capacity: u64, extra_partitions: u32, sizes: &[u64]) -> bool {
    let mut offset = 0u64;
    let mut partition = 0u32;

    for &size in sizes {
        if offset + size < capacity {
            offset += size;
        } else if partition < extra_partitions && size < capacity {
            partition += 1;
            offset = size;
        } else {
            return false;
        }
    }

    true
}

/// Assigns physical placement to every tensor, one region cursor per linear
/// region. Placement happens once per tensor, after all stride requirements
/// are merged.
#[derive(Debug)]
pub struct Allocator {
    resources: Resources,
    blob_tail: u64,
    bss_tail: u64,
    ddr_tail: u64,
    on_chip_tail: u64,
}

impl Allocator {
    pub fn new(resources: Resources) -> Allocator {
        Allocator {
            resources,
            blob_tail: 0,
            bss_tail: 0,
            ddr_tail: 0,
            on_chip_tail: 0,
        }
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    fn reserve_blob(&mut self, size: u64, alignment: u64) -> u64 {
        let offset = align_up(self.blob_tail, alignment);
        self.blob_tail = offset + size;
        offset
    }

    /// Place an input or output tensor. Slot index and buffer offset come
    /// from the external pipeline.
    pub fn allocate_io(
        &mut self,
        tensors: &mut Tensors,
        id: TensorId,
        io_idx: u32,
        io_buffer_offset: u64,
    ) {
        let location = match tensors.node(id).usage() {
            TensorUsage::Input => Location::Input,
            TensorUsage::Output => Location::Output,
            usage => panic!(
                "I/O placement requested for {} whose usage is {}",
                tensors.node(id).name(),
                usage
            ),
        };
        tensors.set_io_index(id, io_idx);
        tensors.set_io_info(id, location, io_buffer_offset);
    }

    /// Place a Const, Temp or Intermediate tensor.
    ///
    /// Consts go into the constant pool, temps into zero-init scratch.
    /// Top-level intermediates prefer on-chip scratch and fall back to
    /// general memory when capacity runs out; view children inherit their
    /// parent's region at the parent's offset plus the view offset.
    pub fn allocate_data(&mut self, tensors: &mut Tensors, id: TensorId) {
        let node = tensors.node(id);
        assert!(
            node.location().location == Location::None,
            "tensor {} placed twice",
            node.name()
        );

        if let Some(edge) = node.parent_view() {
            let parent = tensors.node(edge.parent).location();
            assert!(
                parent.location != Location::None,
                "view child {} placed before its parent",
                node.name()
            );
            let offset = edge.offset;
            tensors.set_data_allocation_info(
                id,
                DataLocation {
                    location: parent.location,
                    offset: parent.offset + offset,
                },
            );
            return;
        }

        let size = align_up(tensors.total_byte_size(id), DATA_ALIGNMENT);
        let location = match node.usage() {
            TensorUsage::Const => {
                let offset = self.reserve_blob(size, DATA_ALIGNMENT);
                DataLocation {
                    location: Location::Blob,
                    offset,
                }
            }
            TensorUsage::Temp => {
                let offset = self.bss_tail;
                self.bss_tail += size;
                DataLocation {
                    location: Location::Bss,
                    offset,
                }
            }
            TensorUsage::Intermediate => {
                if self.on_chip_tail + size <= self.resources.on_chip_capacity {
                    let offset = self.on_chip_tail;
                    self.on_chip_tail += size;
                    DataLocation {
                        location: Location::OnChip,
                        offset,
                    }
                } else {
                    warn!(
                        tensor = %tensors.node(id).name(),
                        size,
                        "on-chip scratch exhausted, spilling to general memory"
                    );
                    let offset = self.ddr_tail;
                    self.ddr_tail += size;
                    DataLocation {
                        location: Location::Ddr,
                        offset,
                    }
                }
            }
            usage => panic!(
                "data placement requested for {} whose usage is {}",
                tensors.node(id).name(),
                usage
            ),
        };
        debug!(
            tensor = %tensors.node(id).name(),
            region = %location.location,
            offset = location.offset,
            "placed tensor"
        );
        tensors.set_data_allocation_info(id, location);
    }

    /// Place a tensor's dims and strides.
    ///
    /// Static shapes land in the constant pool. A dynamic shape (one fed by
    /// a shape-source edge) keeps its dims in the producing tensor's output
    /// memory, and additionally reserves an upper-bound copy of the dims in
    /// the pool so that self-contained records can always be emitted.
    pub fn allocate_shape(&mut self, tensors: &mut Tensors, id: TensorId) {
        if tensors.is_shape_allocated(id) {
            return;
        }

        let num_dims = tensors.node(id).desc().num_dims() as u64;
        let entry_size = num_dims * 4;

        let strides_offset = self.reserve_blob(entry_size, 4);
        if let Some(source) = tensors.node(id).shape_source() {
            assert!(
                tensors.node(source).usage() == TensorUsage::Output,
                "shape source {} of {} is not an output tensor",
                tensors.node(source).name(),
                tensors.node(id).name()
            );
            let dims_upper_bound_offset = self.reserve_blob(entry_size, 4);
            tensors.set_shape_allocation_info(
                id,
                ShapeLocation {
                    dims_location: Location::Output,
                    dims_offset: tensors.node(source).location().offset,
                    strides_location: Location::Blob,
                    strides_offset,
                },
            );
            tensors.set_shape_upper_bound(
                id,
                crate::model::ShapeUpperBound {
                    dims_offset: dims_upper_bound_offset,
                    strides_offset,
                },
            );
        } else {
            let dims_offset = self.reserve_blob(entry_size, 4);
            tensors.set_shape_allocation_info(
                id,
                ShapeLocation {
                    dims_location: Location::Blob,
                    dims_offset,
                    strides_location: Location::Blob,
                    strides_offset,
                },
            );
        }
    }

    /// Bytes reserved in the constant pool so far.
    pub fn blob_size(&self) -> u64 {
        self.blob_tail
    }

    /// Bytes reserved in zero-init scratch so far.
    pub fn bss_size(&self) -> u64 {
        self.bss_tail
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::{Dim, DimValues, DimsOrder, ElemType, TensorDesc};
    use crate::model::TensorContent;

    fn chw(c: u64, h: u64, w: u64) -> TensorDesc {
        TensorDesc::new(
            ElemType::Fp16,
            DimsOrder::CHW,
            DimValues::from_entries(&[(Dim::C, c), (Dim::H, h), (Dim::W, w)]),
        )
    }

    #[test]
    fn feasibility_rollover() {
        // The second buffer overflows into the extra partition, the third
        // fits behind it.
        assert!(scratch_fits(100, 1, &[60, 50, 30]));
        // No partition budget to roll over into.
        assert!(!scratch_fits(100, 0, &[60, 50]));
        // Exact fill is treated as not fitting and must roll over.
        assert!(!scratch_fits(100, 0, &[60, 40]));
        assert!(scratch_fits(100, 1, &[60, 40]));
        // A buffer as large as a whole partition never fits.
        assert!(!scratch_fits(100, 4, &[100]));
        assert!(scratch_fits(100, 4, &[99, 99, 99]));
    }

    #[test]
    fn const_goes_to_blob() {
        let mut tensors = Tensors::new();
        let scalar = TensorDesc::new(
            ElemType::Fp32,
            DimsOrder::C,
            DimValues::from_entries(&[(Dim::C, 1)]),
        );
        let id = tensors.add_const("weights", scalar, TensorContent::F32(vec![1.0]));
        let mut alloc = Allocator::new(Resources::default());
        alloc.allocate_data(&mut tensors, id);
        assert_eq!(tensors.node(id).location().location, Location::Blob);
    }

    #[test]
    #[should_panic]
    fn const_rejects_other_regions() {
        let mut tensors = Tensors::new();
        let scalar = TensorDesc::new(
            ElemType::Fp32,
            DimsOrder::C,
            DimValues::from_entries(&[(Dim::C, 1)]),
        );
        let id = tensors.add_const("weights", scalar, TensorContent::F32(vec![1.0]));
        tensors.set_data_allocation_info(
            id,
            DataLocation {
                location: Location::Ddr,
                offset: 0,
            },
        );
    }

    #[test]
    fn intermediates_spill_to_ddr() {
        let mut tensors = Tensors::new();
        let a = tensors.add("a", TensorUsage::Intermediate, chw(8, 4, 4));
        let b = tensors.add("b", TensorUsage::Intermediate, chw(8, 4, 4));
        let mut alloc = Allocator::new(Resources {
            on_chip_capacity: 300,
            compute_lanes: 1,
        });
        alloc.allocate_data(&mut tensors, a);
        alloc.allocate_data(&mut tensors, b);
        assert_eq!(tensors.node(a).location().location, Location::OnChip);
        assert_eq!(tensors.node(b).location().location, Location::Ddr);
    }

    #[test]
    fn view_children_inherit_parent_placement() {
        let mut tensors = Tensors::new();
        let parent = tensors.add("parent", TensorUsage::Intermediate, chw(8, 4, 4));
        let child = tensors.add("child", TensorUsage::Intermediate, chw(2, 4, 4));
        tensors.attach_view(child, parent, 32).unwrap();
        let mut alloc = Allocator::new(Resources::default());
        alloc.allocate_data(&mut tensors, parent);
        alloc.allocate_data(&mut tensors, child);
        let parent_loc = tensors.node(parent).location();
        let child_loc = tensors.node(child).location();
        assert_eq!(child_loc.location, parent_loc.location);
        assert_eq!(child_loc.offset, parent_loc.offset + 32);
    }

    #[test]
    fn dynamic_shape_gets_upper_bound() {
        let mut tensors = Tensors::new();
        let carrier = tensors.add(
            "shape",
            TensorUsage::Output,
            TensorDesc::new(
                ElemType::I32,
                DimsOrder::C,
                DimValues::from_entries(&[(Dim::C, 2)]),
            ),
        );
        let data = tensors.add("indices", TensorUsage::Output, chw(1, 16, 3));
        tensors.attach_shape_source(data, carrier).unwrap();

        let mut alloc = Allocator::new(Resources::default());
        alloc.allocate_io(&mut tensors, carrier, 0, 0);
        alloc.allocate_io(&mut tensors, data, 1, 64);
        alloc.allocate_shape(&mut tensors, carrier);
        alloc.allocate_shape(&mut tensors, data);

        let shape = tensors.node(data).shape_location();
        assert_eq!(shape.dims_location, Location::Output);
        assert_eq!(shape.strides_location, Location::Blob);
        let upper = tensors.node(data).shape_upper_bound().unwrap();
        assert_eq!(upper.strides_offset, shape.strides_offset);

        let static_shape = tensors.node(carrier).shape_location();
        assert_eq!(static_shape.dims_location, Location::Blob);
        assert!(tensors.node(carrier).shape_upper_bound().is_none());
    }
}
