//! Tensor descriptors: element types, named dimensions, permutation codes
//! and per-dimension value maps.

use serde::{Deserialize, Serialize};

/// Maximum number of named dimensions a tensor can carry.
pub const MAX_DIMS: usize = 5;

/// Element type of a tensor, with its wire code fixed by the loader contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum ElemType {
    Fp16,
    Fp32,
    I32,
    U8,
    I8,
}

impl ElemType {
    /// Code written into the serialized descriptor record.
    pub fn wire_code(&self) -> u32 {
        match self {
            ElemType::Fp16 => 0,
            ElemType::Fp32 => 1,
            ElemType::I32 => 2,
            ElemType::U8 => 3,
            ElemType::I8 => 4,
        }
    }

    pub fn elem_size(&self) -> u64 {
        match self {
            ElemType::Fp16 => 2,
            ElemType::Fp32 => 4,
            ElemType::I32 => 4,
            ElemType::U8 => 1,
            ElemType::I8 => 1,
        }
    }
}

/// Named tensor dimensions. The discriminant is the canonical index used by
/// [`DimValues`] and by permutation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum Dim {
    W,
    H,
    C,
    N,
    D,
}

impl Dim {
    pub fn index(&self) -> usize {
        match self {
            Dim::W => 0,
            Dim::H => 1,
            Dim::C => 2,
            Dim::N => 3,
            Dim::D => 4,
        }
    }

    fn from_index(idx: usize) -> Dim {
        match idx {
            0 => Dim::W,
            1 => Dim::H,
            2 => Dim::C,
            3 => Dim::N,
            4 => Dim::D,
            _ => panic!("dimension index {} out of range", idx),
        }
    }
}

/// Dimension ordering as a packed permutation code.
///
/// Each nibble, starting from the least significant, names one dimension from
/// innermost (fastest varying) to outermost; the nibble value is the
/// dimension index plus one. `NCHW` therefore has innermost `W` and code
/// `0x4321`. The code itself is part of the serialized descriptor record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimsOrder(u32);

impl DimsOrder {
    pub const C: DimsOrder = DimsOrder(0x3);
    pub const NC: DimsOrder = DimsOrder(0x43);
    pub const CHW: DimsOrder = DimsOrder(0x321);
    pub const HWC: DimsOrder = DimsOrder(0x213);
    pub const NCHW: DimsOrder = DimsOrder(0x4321);
    pub const NHWC: DimsOrder = DimsOrder(0x4213);
    pub const NCDHW: DimsOrder = DimsOrder(0x43521);

    /// Build an order from a permutation listed innermost first.
    pub fn from_permutation(perm: &[Dim]) -> DimsOrder {
        assert!(
            !perm.is_empty() && perm.len() <= MAX_DIMS,
            "permutation must name between 1 and {} dimensions, got {}",
            MAX_DIMS,
            perm.len()
        );
        let mut code = 0u32;
        let mut seen = [false; MAX_DIMS];
        for (pos, dim) in perm.iter().enumerate() {
            assert!(!seen[dim.index()], "dimension {} repeated in permutation", dim);
            seen[dim.index()] = true;
            code |= ((dim.index() as u32) + 1) << (4 * pos);
        }
        DimsOrder(code)
    }

    pub fn code(&self) -> u32 {
        self.0
    }

    /// Permutation listed innermost first.
    pub fn to_permutation(&self) -> Vec<Dim> {
        let mut perm = Vec::new();
        let mut code = self.0;
        while code != 0 {
            let nibble = (code & 0xF) as usize;
            assert!(nibble >= 1 && nibble <= MAX_DIMS, "corrupt dims-order code {:#x}", self.0);
            perm.push(Dim::from_index(nibble - 1));
            code >>= 4;
        }
        perm
    }

    pub fn num_dims(&self) -> usize {
        let mut n = 0;
        let mut code = self.0;
        while code != 0 {
            n += 1;
            code >>= 4;
        }
        n
    }

    pub fn has_dim(&self, dim: Dim) -> bool {
        self.to_permutation().contains(&dim)
    }
}

impl std::fmt::Display for DimsOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for dim in self.to_permutation().iter().rev() {
            write!(f, "{}", dim)?;
        }
        Ok(())
    }
}

/// Per-dimension value map, used for sizes, strides and coordinates alike.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimValues {
    values: [Option<u64>; MAX_DIMS],
}

impl DimValues {
    pub fn new() -> DimValues {
        DimValues::default()
    }

    pub fn from_entries(entries: &[(Dim, u64)]) -> DimValues {
        let mut values = DimValues::new();
        for (dim, value) in entries {
            values.set(*dim, *value);
        }
        values
    }

    pub fn set(&mut self, dim: Dim, value: u64) {
        self.values[dim.index()] = Some(value);
    }

    pub fn get(&self, dim: Dim) -> Option<u64> {
        self.values[dim.index()]
    }

    pub fn contains(&self, dim: Dim) -> bool {
        self.values[dim.index()].is_some()
    }

    pub fn len(&self) -> usize {
        self.values.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Entries in canonical dimension-index order.
    pub fn iter(&self) -> impl Iterator<Item = (Dim, u64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.map(|v| (Dim::from_index(idx), v)))
    }
}

/// Immutable description of a tensor: element type, named dimension sizes and
/// the dimension ordering. Once attached to a tensor node it never changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    elem_type: ElemType,
    dims: DimValues,
    order: DimsOrder,
}

impl TensorDesc {
    pub fn new(elem_type: ElemType, order: DimsOrder, dims: DimValues) -> TensorDesc {
        let perm = order.to_permutation();
        assert_eq!(
            perm.len(),
            dims.len(),
            "descriptor order {} names {} dimensions but {} sizes are given",
            order,
            perm.len(),
            dims.len()
        );
        for dim in &perm {
            assert!(
                dims.contains(*dim),
                "descriptor order {} names dimension {} with no size",
                order,
                dim
            );
        }
        TensorDesc { elem_type, dims, order }
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem_type
    }

    pub fn order(&self) -> DimsOrder {
        self.order
    }

    pub fn dims(&self) -> &DimValues {
        &self.dims
    }

    pub fn dim(&self, dim: Dim) -> Option<u64> {
        self.dims.get(dim)
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn total_elems(&self) -> u64 {
        self.dims.iter().map(|(_, size)| size).product()
    }

    pub fn elem_size(&self) -> u64 {
        self.elem_type.elem_size()
    }
}
