//! Per-tensor stride requirements and their reconciliation across operations.

use serde::{Deserialize, Serialize};

use crate::descriptor::{DimValues, TensorDesc};

/// Requirement on the stride of a single permutation position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrideReq {
    /// No constraint, the planner picks a compact stride.
    Any,
    /// Stride pinned to an exact byte value.
    Pinned(u64),
}

/// Stride requirements for a whole tensor.
///
/// Positions are permutation positions, innermost first. A requirement may
/// instead carry one fixed full vector of strides; once present it is used
/// verbatim and per-position reasoning is skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StridesRequirement {
    reqs: Vec<StrideReq>,
    fixed: Option<DimValues>,
}

impl StridesRequirement {
    pub fn new() -> StridesRequirement {
        StridesRequirement::default()
    }

    pub fn fixed(strides: DimValues) -> StridesRequirement {
        StridesRequirement {
            reqs: Vec::new(),
            fixed: Some(strides),
        }
    }

    /// Pin the stride at permutation position `pos` to `value` bytes.
    pub fn add(mut self, pos: usize, value: u64) -> StridesRequirement {
        if self.reqs.len() <= pos {
            self.reqs.resize(pos + 1, StrideReq::Any);
        }
        self.reqs[pos] = StrideReq::Pinned(value);
        self
    }

    pub fn get(&self, pos: usize) -> StrideReq {
        self.reqs.get(pos).copied().unwrap_or(StrideReq::Any)
    }

    pub fn fixed_strides(&self) -> Option<&DimValues> {
        self.fixed.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_none() && self.reqs.iter().all(|r| *r == StrideReq::Any)
    }
}

/// Merge two requirements dimension by dimension.
///
/// A fixed full vector on either side wins outright (the existing side is
/// preferred when both carry one). Otherwise pinned beats free, and on a
/// pinned/pinned conflict the existing side is kept; the caller must check
/// the merged result against both inputs afterwards, so a genuine conflict
/// surfaces as a fatal invariant failure rather than a silent override.
pub fn merge(existing: &StridesRequirement, incoming: &StridesRequirement) -> StridesRequirement {
    let fixed_side = if existing.fixed.is_some() { existing } else { incoming };
    if fixed_side.fixed.is_some() {
        return fixed_side.clone();
    }

    let len = existing.reqs.len().max(incoming.reqs.len());
    let mut merged = StridesRequirement::new();
    for pos in 0..len {
        match (existing.get(pos), incoming.get(pos)) {
            (StrideReq::Any, StrideReq::Any) => {}
            (StrideReq::Pinned(value), _) | (StrideReq::Any, StrideReq::Pinned(value)) => {
                merged = merged.add(pos, value);
            }
        }
    }
    merged
}

/// Derive concrete byte strides for `desc` under `reqs`.
///
/// Strides grow compactly from the innermost dimension outwards; pinned
/// positions override the compact value and later defaults build on top of
/// them. A fixed vector is returned verbatim.
pub fn calc_strides(desc: &TensorDesc, reqs: &StridesRequirement) -> DimValues {
    if let Some(fixed) = &reqs.fixed {
        return fixed.clone();
    }

    let mut strides = DimValues::new();
    let mut next = desc.elem_size();
    for (pos, dim) in desc.order().to_permutation().into_iter().enumerate() {
        let stride = match reqs.get(pos) {
            StrideReq::Pinned(value) => value,
            StrideReq::Any => next,
        };
        strides.set(dim, stride);
        let size = desc
            .dim(dim)
            .expect("descriptor invariant: every ordered dimension has a size");
        next = stride * size;
    }
    strides
}

/// Check that `strides` satisfies `reqs` for a tensor described by `desc`.
pub fn check_strides(desc: &TensorDesc, strides: &DimValues, reqs: &StridesRequirement) -> bool {
    if let Some(fixed) = &reqs.fixed {
        return fixed.iter().all(|(dim, value)| strides.get(dim) == Some(value));
    }

    desc.order()
        .to_permutation()
        .into_iter()
        .enumerate()
        .all(|(pos, dim)| match reqs.get(pos) {
            StrideReq::Any => true,
            StrideReq::Pinned(value) => strides.get(dim) == Some(value),
        })
}
