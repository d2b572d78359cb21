//! Shared fixtures for the crate's tests.

use half::f16;

use crate::{
    descriptor::{Dim, DimValues, DimsOrder, ElemType, TensorDesc},
    model::{Model, TensorContent, TensorId, TensorUsage},
    ops::nms::NmsOutputs,
};

pub fn scalar(elem: ElemType) -> TensorDesc {
    TensorDesc::new(elem, DimsOrder::C, DimValues::from_entries(&[(Dim::C, 1)]))
}

pub fn chw(elem: ElemType, c: u64, h: u64, w: u64) -> TensorDesc {
    TensorDesc::new(
        elem,
        DimsOrder::CHW,
        DimValues::from_entries(&[(Dim::C, c), (Dim::H, h), (Dim::W, w)]),
    )
}

pub fn nc(elem: ElemType, n: u64, c: u64) -> TensorDesc {
    TensorDesc::new(
        elem,
        DimsOrder::NC,
        DimValues::from_entries(&[(Dim::N, n), (Dim::C, c)]),
    )
}

/// A model populated with the tensors a bounded-output NMS consumes and
/// produces: five data inputs, the constant sigma input, the selected-indices
/// output and its shape carrier.
pub fn bounded_nms_fixture(boxes: u64, sigma: f32) -> (Model, Vec<TensorId>, NmsOutputs) {
    let mut model = Model::new();
    let tensors = model.tensors_mut();
    let inputs = vec![
        tensors.add("boxes", TensorUsage::Input, chw(ElemType::Fp16, 1, boxes, 4)),
        tensors.add("scores", TensorUsage::Input, chw(ElemType::Fp16, 1, 1, boxes)),
        tensors.add("max-count", TensorUsage::Input, scalar(ElemType::I32)),
        tensors.add("iou-threshold", TensorUsage::Input, scalar(ElemType::Fp16)),
        tensors.add("score-threshold", TensorUsage::Input, scalar(ElemType::Fp16)),
        tensors.add_const(
            "sigma",
            scalar(ElemType::Fp16),
            TensorContent::F16(vec![f16::from_f32(sigma)]),
        ),
    ];
    let outputs = NmsOutputs {
        indices: tensors.add("indices", TensorUsage::Output, nc(ElemType::I32, boxes, 3)),
        scores: None,
        shape: tensors.add(
            "indices-shape",
            TensorUsage::Output,
            TensorDesc::new(
                ElemType::I32,
                DimsOrder::C,
                DimValues::from_entries(&[(Dim::C, 2)]),
            ),
        ),
    };
    (model, inputs, outputs)
}
