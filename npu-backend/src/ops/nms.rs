//! Bounded-output non-max-suppression.
//!
//! The output count is only bounded at compile time, so the operation
//! produces its selected indices plus a shape-carrier tensor holding the
//! actual output dims, and the indices tensor sources its runtime shape from
//! the carrier.

use tracing::debug;

use crate::{
    alloc::{scratch_fits, Resources},
    descriptor::{Dim, DimValues, DimsOrder, ElemType, TensorDesc},
    model::{Model, OpId, OpIo, TensorId, TensorUsage, Tensors},
    serialize::{self, BlobWriter},
};

use super::{ComputeNeed, GraphOp, OpError};

/// One compute lane can handle at most this many boxes per image; larger
/// workloads need every lane.
const MAX_BOXES_PER_LANE: u64 = 3650;

const SCRATCH_ALIGNMENT: u64 = 64;

/// Box-coordinate convention of the incoming boxes tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoxEncoding {
    /// Two opposite corners.
    Corner,
    /// Center point plus width and height.
    Center,
}

/// Raw parameters pulled from the network description.
#[derive(Clone, Copy, Debug)]
pub struct NmsParams {
    pub center_point_box: bool,
    pub sort_result_descending: bool,
}

/// Output tensors handed over by the frontend. The middle selected-scores
/// slot exists in the source schema but is not supported on this target and
/// must be absent.
#[derive(Clone, Copy, Debug)]
pub struct NmsOutputs {
    pub indices: TensorId,
    pub scores: Option<TensorId>,
    pub shape: TensorId,
}

#[derive(Debug)]
pub struct BoundedNms {
    name: String,
    center_point_box: bool,
}

impl BoundedNms {
    /// Validate the frontend-supplied configuration, wire the operation into
    /// the graph and decide whether it needs a general-memory scratch
    /// fallback.
    pub fn build(
        model: &mut Model,
        name: impl Into<String>,
        params: NmsParams,
        inputs: &[TensorId],
        outputs: NmsOutputs,
        resources: &Resources,
    ) -> Result<OpId, OpError> {
        let name = name.into();
        if inputs.len() != 6 {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{} expects 6 inputs, got {}",
                name,
                inputs.len()
            )));
        }

        let sigma = inputs[5];
        let sigma_node = model.tensors().node(sigma);
        if sigma_node.usage() != TensorUsage::Const {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: soft-NMS sigma must be a compile-time constant, its usage is {}",
                name,
                sigma_node.usage()
            )));
        }
        if sigma_node.desc().total_elems() != 1 {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: soft-NMS sigma must hold 1 value, it holds {}",
                name,
                sigma_node.desc().total_elems()
            )));
        }
        let sigma_value = sigma_node
            .content()
            .and_then(|content| content.scalar_f32())
            .unwrap_or_else(|| {
                panic!(
                    "const tensor {} carries no scalar content",
                    sigma_node.name()
                )
            });
        if sigma_value != 0.0 {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: the only supported soft-NMS sigma is 0, got {}",
                name, sigma_value
            )));
        }

        if let Some(scores) = outputs.scores {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: the selected-scores output ({}) is not supported",
                name,
                model.tensors().node(scores).name()
            )));
        }
        if params.sort_result_descending {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: sorting results by descending score is not supported on this target",
                name
            )));
        }

        let boxes_per_image = model
            .tensors()
            .node(inputs[0])
            .desc()
            .dim(Dim::H)
            .ok_or_else(|| {
                OpError::UnsupportedConfiguration(format!(
                    "{}: the boxes tensor has no H dimension",
                    name
                ))
            })?;

        // The indices tensor's real shape is only known at run time; the
        // carrier output supplies it.
        model
            .tensors_mut()
            .attach_shape_source(outputs.indices, outputs.shape)?;

        // The sigma input is fully consumed at compile time and dropped from
        // the operand list.
        let op = model.add_op(
            Box::new(BoundedNms {
                name,
                center_point_box: params.center_point_box,
            }),
            inputs[..5].to_vec(),
            vec![outputs.indices, outputs.shape],
        );

        let sizes = scratch_buffer_sizes(boxes_per_image);
        if !scratch_fits(resources.on_chip_capacity, resources.compute_lanes, &sizes) {
            let fallback = sizes[0] + sizes[1] + sizes[2] + 2 * SCRATCH_ALIGNMENT;
            debug!(
                op = %model.op(op).operation.name(),
                bytes = fallback,
                "on-chip scratch infeasible, attaching general-memory buffer"
            );
            model.add_temp_buffer(
                op,
                TensorDesc::new(
                    ElemType::U8,
                    DimsOrder::C,
                    DimValues::from_entries(&[(Dim::C, fallback)]),
                ),
            );
        }

        Ok(op)
    }

    pub fn box_encoding(&self) -> BoxEncoding {
        if self.center_point_box {
            BoxEncoding::Center
        } else {
            BoxEncoding::Corner
        }
    }
}

/// Working-set sizes for one image: two 16-bit buffers and one 32-bit buffer
/// growing linearly with the box count, plus a fixed 256-slot accumulator.
fn scratch_buffer_sizes(boxes_per_image: u64) -> [u64; 4] {
    [
        2 * 2 * 4 * boxes_per_image,
        2 * 2 * boxes_per_image,
        2 * 4 * boxes_per_image,
        4 * 4 * 256,
    ]
}

fn check_elem_types(
    op: &str,
    tensors: &Tensors,
    ids: &[TensorId],
    expected: &[ElemType],
    what: &str,
) -> Result<(), OpError> {
    if ids.len() != expected.len() {
        return Err(OpError::UnsupportedConfiguration(format!(
            "{} expects {} {}s, got {}",
            op,
            expected.len(),
            what,
            ids.len()
        )));
    }
    for (idx, (&id, &want)) in ids.iter().zip(expected).enumerate() {
        let got = tensors.node(id).desc().elem_type();
        if got != want {
            return Err(OpError::UnsupportedConfiguration(format!(
                "{}: {} {} ({}) must be {}, got {}",
                op,
                what,
                idx,
                tensors.node(id).name(),
                want,
                got
            )));
        }
    }
    Ok(())
}

impl GraphOp for BoundedNms {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, io: &OpIo, tensors: &Tensors) -> Result<(), OpError> {
        check_elem_types(
            &self.name,
            tensors,
            &io.inputs,
            &[
                ElemType::Fp16,
                ElemType::Fp16,
                ElemType::I32,
                ElemType::Fp16,
                ElemType::Fp16,
            ],
            "input",
        )?;
        check_elem_types(
            &self.name,
            tensors,
            &io.outputs,
            &[ElemType::I32, ElemType::I32],
            "output",
        )
    }

    fn compute_resource_need(&self, io: &OpIo, tensors: &Tensors) -> ComputeNeed {
        let boxes_per_image = tensors
            .node(io.inputs[0])
            .desc()
            .dim(Dim::H)
            .expect("boxes tensor has an H dimension, checked when the operation was built");
        if boxes_per_image > MAX_BOXES_PER_LANE {
            ComputeNeed::NeedsAll
        } else {
            ComputeNeed::NeedsOne
        }
    }

    fn emit_parameters(&self, io: &OpIo, writer: &mut BlobWriter) {
        writer.append_i32(self.center_point_box as i32);
        writer.append_i32(!io.temps.is_empty() as i32);
    }

    fn emit_operands(&self, io: &OpIo, tensors: &Tensors, writer: &mut BlobWriter) {
        for &input in &io.inputs {
            serialize::serialize_buffer(tensors, input, writer);
        }
        for &output in &io.outputs {
            serialize::serialize_buffer(tensors, output, writer);
        }
        if let Some(&temp) = io.temps.first() {
            serialize::serialize_buffer(tensors, temp, writer);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{self, bounded_nms_fixture as fixture};

    fn default_params() -> NmsParams {
        NmsParams {
            center_point_box: false,
            sort_result_descending: false,
        }
    }

    #[test]
    fn lane_demand_follows_box_count() {
        for (boxes, expected) in [(4000, ComputeNeed::NeedsAll), (1000, ComputeNeed::NeedsOne)] {
            let (mut model, inputs, outputs) = fixture(boxes, 0.0);
            let op = BoundedNms::build(
                &mut model,
                "nms",
                default_params(),
                &inputs,
                outputs,
                &Resources::default(),
            )
            .unwrap();
            let node = model.op(op);
            assert_eq!(
                node.operation.compute_resource_need(&node.io, model.tensors()),
                expected
            );
        }
    }

    #[test]
    fn nonzero_sigma_is_rejected() {
        let (mut model, inputs, outputs) = fixture(1000, 0.5);
        let err = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OpError::UnsupportedConfiguration(_)));
        assert!(err.to_string().contains("sigma"));

        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
    }

    #[test]
    fn descending_sort_is_rejected() {
        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        let err = BoundedNms::build(
            &mut model,
            "nms",
            NmsParams {
                center_point_box: false,
                sort_result_descending: true,
            },
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OpError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn selected_scores_output_is_rejected() {
        let (mut model, inputs, mut outputs) = fixture(1000, 0.0);
        let scores = model
            .tensors_mut()
            .add("selected-scores", TensorUsage::Output, testing::nc(ElemType::I32, 1000, 1));
        outputs.scores = Some(scores);
        let err = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("selected-scores"));
    }

    #[test]
    fn scratch_falls_back_to_general_memory() {
        // Default resources fit comfortably: no temp buffer.
        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        let op = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
        assert!(model.op(op).io.temps.is_empty());

        // A tiny on-chip budget forces the fallback buffer.
        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        let op = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources {
                on_chip_capacity: 1024,
                compute_lanes: 1,
            },
        )
        .unwrap();
        let temps = &model.op(op).io.temps;
        assert_eq!(temps.len(), 1);
        let expected = 16 * 1000 + 4 * 1000 + 8 * 1000 + 2 * 64;
        assert_eq!(model.tensors().total_byte_size(temps[0]), expected);
    }

    #[test]
    fn validate_checks_element_types() {
        let (mut model, mut inputs, outputs) = fixture(1000, 0.0);
        // Swap the scores tensor for an integer one.
        inputs[1] = model
            .tensors_mut()
            .add("bad-scores", TensorUsage::Input, testing::chw(ElemType::I32, 1, 1, 1000));
        let op = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
        let node = model.op(op);
        let err = node.operation.validate(&node.io, model.tensors()).unwrap_err();
        assert!(err.to_string().contains("bad-scores"));

        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        let op = BoundedNms::build(
            &mut model,
            "nms",
            default_params(),
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
        let node = model.op(op);
        node.operation.validate(&node.io, model.tensors()).unwrap();
    }

    #[test]
    fn parameters_encode_flags() {
        let (mut model, inputs, outputs) = fixture(1000, 0.0);
        let op = BoundedNms::build(
            &mut model,
            "nms",
            NmsParams {
                center_point_box: true,
                sort_result_descending: false,
            },
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
        let node = model.op(op);
        let mut writer = BlobWriter::new();
        node.operation.emit_parameters(&node.io, &mut writer);
        assert_eq!(writer.as_bytes(), [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn box_encoding_follows_flag() {
        let nms = BoundedNms {
            name: "nms".to_string(),
            center_point_box: true,
        };
        assert_eq!(nms.box_encoding(), BoxEncoding::Center);
    }
}
