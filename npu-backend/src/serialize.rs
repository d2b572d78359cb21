//! The binary format consumed by the device-side loader.
//!
//! Every field is fixed-width little-endian; field order and widths are part
//! of the loader compatibility contract and must not change independently on
//! the two sides.

use crate::{
    alloc::{align_up, Location, ShapeLocation},
    descriptor::{TensorDesc, MAX_DIMS},
    model::{TensorId, Tensors},
};

/// Append-only byte sink for the emitted blob.
#[derive(Debug, Default)]
pub struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    pub fn new() -> BlobWriter {
        BlobWriter::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn append_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

fn checked_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or_else(|_| panic!("value {} exceeds the 32-bit wire format", value))
}

/// Encode a tensor descriptor record against the given shape placement.
pub fn serialize_desc(desc: &TensorDesc, shape: ShapeLocation, writer: &mut BlobWriter) {
    let perm = desc.order().to_permutation();
    assert!(!perm.is_empty() && perm.len() <= MAX_DIMS);

    writer.append_u32(desc.elem_type().wire_code());
    writer.append_u32(desc.order().code());
    writer.append_u32(perm.len() as u32);

    writer.append_u32(shape.dims_location.wire_code());
    writer.append_u32(checked_u32(shape.dims_offset));
    writer.append_u32(shape.strides_location.wire_code());
    writer.append_u32(checked_u32(shape.strides_offset));
}

fn serialize_io_params(tensors: &Tensors, parent: TensorId, writer: &mut BlobWriter) {
    let io_idx = tensors
        .node(parent)
        .io_idx()
        .unwrap_or_else(|| panic!("tensor {} has no I/O slot assigned", tensors.node(parent).name()));
    writer.append_u32(io_idx);
    writer.append_u32(checked_u32(tensors.total_byte_size(parent)));
}

/// Encode a tensor placement record: the descriptor, the region, I/O
/// parameters for runtime-resident data and shapes, and the byte offset.
pub fn serialize_buffer(tensors: &Tensors, id: TensorId, writer: &mut BlobWriter) {
    let node = tensors.node(id);
    serialize_desc(node.desc(), node.shape_location(), writer);

    let location = node.location();
    writer.append_u32(location.location.wire_code());

    if location.location == Location::Input || location.location == Location::Output {
        serialize_io_params(tensors, tensors.top_parent(id), writer);
    }

    let shape = node.shape_location();
    if shape.dims_location == Location::Output {
        let source = node
            .shape_source()
            .unwrap_or_else(|| panic!("tensor {} has runtime dims but no shape source", node.name()));
        serialize_io_params(tensors, source, writer);
    }
    if shape.strides_location == Location::Output {
        let source = node
            .shape_source()
            .unwrap_or_else(|| panic!("tensor {} has runtime strides but no shape source", node.name()));
        serialize_io_params(tensors, source, writer);
    }

    writer.append_u32(checked_u32(location.offset));
}

/// Encode an I/O directory record: slot index, buffer offset, the tensor
/// name as a 16-byte-aligned NUL-terminated block, then the descriptor with
/// dynamic shape locations resolved to their upper-bound pool positions.
///
/// The record is self-contained: it never references runtime-only regions.
pub fn serialize_io_info(tensors: &Tensors, id: TensorId, writer: &mut BlobWriter) {
    let node = tensors.node(id);
    let io_idx = node
        .io_idx()
        .unwrap_or_else(|| panic!("tensor {} has no I/O slot assigned", node.name()));
    writer.append_u32(io_idx);
    let buffer_offset = node
        .io_buffer_offset()
        .unwrap_or_else(|| panic!("tensor {} has no I/O buffer offset assigned", node.name()));
    writer.append_u32(checked_u32(buffer_offset));

    let name = node.name().as_bytes();
    let name_len = name.len() as u64;
    // One extra byte keeps the name a valid C string even when its length is
    // already a multiple of 16.
    let aligned = align_up(name_len + 1, 16);
    writer.append_u32(checked_u32(aligned));
    writer.append_bytes(name);
    for _ in 0..(aligned - name_len) {
        writer.append_u8(0);
    }

    let mut shape = node.shape_location();
    if shape.dims_location != Location::Blob {
        let upper = node
            .shape_upper_bound()
            .unwrap_or_else(|| panic!("tensor {} has no upper-bound dims in the pool", node.name()));
        shape.dims_location = Location::Blob;
        shape.dims_offset = upper.dims_offset;
    }
    if shape.strides_location != Location::Blob {
        let upper = node
            .shape_upper_bound()
            .unwrap_or_else(|| panic!("tensor {} has no upper-bound strides in the pool", node.name()));
        shape.strides_location = Location::Blob;
        shape.strides_offset = upper.strides_offset;
    }
    serialize_desc(node.desc(), shape, writer);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        alloc::{Allocator, Resources},
        descriptor::{Dim, DimValues, DimsOrder, ElemType},
        model::{TensorUsage},
    };

    /// Little-endian cursor over an encoded record, mirroring the loader.
    struct Reader<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn new(bytes: &'a [u8]) -> Reader<'a> {
            Reader { bytes, pos: 0 }
        }

        fn u32(&mut self) -> u32 {
            let value = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
            self.pos += 4;
            value
        }

        fn skip(&mut self, n: usize) {
            self.pos += n;
        }

        fn done(&self) -> bool {
            self.pos == self.bytes.len()
        }
    }

    fn placed_tensor() -> (Tensors, TensorId) {
        let mut tensors = Tensors::new();
        let id = tensors.add(
            "feature-map",
            TensorUsage::Input,
            TensorDesc::new(
                ElemType::Fp16,
                DimsOrder::NCHW,
                DimValues::from_entries(&[(Dim::N, 1), (Dim::C, 3), (Dim::H, 4), (Dim::W, 5)]),
            ),
        );
        let mut alloc = Allocator::new(Resources::default());
        alloc.allocate_io(&mut tensors, id, 2, 768);
        alloc.allocate_shape(&mut tensors, id);
        (tensors, id)
    }

    #[test]
    fn buffer_record_round_trips() {
        let (tensors, id) = placed_tensor();
        let mut writer = BlobWriter::new();
        serialize_buffer(&tensors, id, &mut writer);

        let node = tensors.node(id);
        let mut r = Reader::new(writer.as_bytes());
        assert_eq!(r.u32(), ElemType::Fp16.wire_code());
        assert_eq!(r.u32(), DimsOrder::NCHW.code());
        assert_eq!(r.u32(), 4);
        assert_eq!(r.u32(), Location::Blob.wire_code());
        assert_eq!(r.u32() as u64, node.shape_location().dims_offset);
        assert_eq!(r.u32(), Location::Blob.wire_code());
        assert_eq!(r.u32() as u64, node.shape_location().strides_offset);
        assert_eq!(r.u32(), Location::Input.wire_code());
        assert_eq!(r.u32(), 2); // I/O slot
        assert_eq!(r.u32() as u64, tensors.total_byte_size(id));
        assert_eq!(r.u32(), 0); // placement offset inside the input region
        assert!(r.done());
    }

    #[test]
    fn encoding_is_deterministic() {
        let (tensors, id) = placed_tensor();
        let mut first = BlobWriter::new();
        serialize_buffer(&tensors, id, &mut first);
        let mut second = BlobWriter::new();
        serialize_buffer(&tensors, id, &mut second);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn io_record_name_block_is_aligned() {
        let (tensors, id) = placed_tensor();
        let mut writer = BlobWriter::new();
        serialize_io_info(&tensors, id, &mut writer);

        let mut r = Reader::new(writer.as_bytes());
        assert_eq!(r.u32(), 2);
        assert_eq!(r.u32(), 768);
        // "feature-map" is 11 bytes; 12 with the terminator, aligned to 16.
        let aligned = r.u32();
        assert_eq!(aligned, 16);
        let name_block = &writer.as_bytes()[r.pos..r.pos + aligned as usize];
        assert_eq!(&name_block[..11], b"feature-map");
        assert!(name_block[11..].iter().all(|b| *b == 0));
        r.skip(aligned as usize);
        // Descriptor record follows, fully Blob-resolved.
        assert_eq!(r.u32(), ElemType::Fp16.wire_code());
        assert_eq!(r.u32(), DimsOrder::NCHW.code());
        assert_eq!(r.u32(), 4);
        assert_eq!(r.u32(), Location::Blob.wire_code());
    }

    #[test]
    fn name_already_multiple_of_16_still_terminated() {
        let mut tensors = Tensors::new();
        let id = tensors.add(
            "exactly-16-chars",
            TensorUsage::Output,
            TensorDesc::new(
                ElemType::I32,
                DimsOrder::C,
                DimValues::from_entries(&[(Dim::C, 4)]),
            ),
        );
        let mut alloc = Allocator::new(Resources::default());
        alloc.allocate_io(&mut tensors, id, 0, 0);
        alloc.allocate_shape(&mut tensors, id);

        let mut writer = BlobWriter::new();
        serialize_io_info(&tensors, id, &mut writer);
        let mut r = Reader::new(writer.as_bytes());
        r.skip(8);
        // 16 name bytes + forced terminator rounds up to 32.
        assert_eq!(r.u32(), 32);
    }
}
