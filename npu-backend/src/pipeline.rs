//! Ordered phase glue around the operation hooks.
//!
//! The full pass scheduler lives outside this crate; this runner documents
//! and enforces the hook order it must follow: layout propagation, stride
//! reporting, placement, layout finalization, validation, resource queries,
//! then emission. Compilation is a single-threaded, deterministic batch
//! transformation.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use tracing::debug;

use crate::{
    alloc::{align_up, Allocator, Resources, DATA_ALIGNMENT},
    model::{Model, OpNode, TensorUsage, VisitAction},
    ops::{BatchInfo, OrderInfo, StridesInfo},
    serialize::{self, BlobWriter},
};

/// Run all compilation phases over `model` and emit the final blob.
pub fn compile(model: &mut Model, resources: &Resources) -> Result<Vec<u8>> {
    let io_list = model.io_tensors();
    let (tensors, ops) = model.parts_mut();

    // Dimension-order propagation. Reconciling a divergent request (by
    // inserting conversion operations) is the pass driver's job, so a
    // mismatch here is a clean failure rather than a silent relayout.
    for op in ops.iter() {
        let mut orders = OrderInfo::for_io(&op.io);
        op.operation.propagate_layout(&op.io, tensors, &mut orders);
        for (ids, requested) in [
            (&op.io.inputs, orders.iter_inputs().collect_vec()),
            (&op.io.outputs, orders.iter_outputs().collect_vec()),
        ] {
            for (idx, order) in requested {
                let node = tensors.node(ids[idx]);
                if node.desc().order() != *order {
                    bail!(
                        "operation {} requests order {} on tensor {} laid out as {}",
                        op.operation.name(),
                        order,
                        node.name(),
                        node.desc().order()
                    );
                }
            }
        }
    }

    // Stride requirements, merged tensor by tensor.
    for op in ops.iter() {
        let mut reqs = StridesInfo::for_io(&op.io);
        op.operation.report_stride_requirements(&op.io, tensors, &mut reqs);
        let input_reqs = reqs
            .iter_inputs()
            .map(|(idx, req)| (op.io.inputs[idx], req.clone()))
            .collect_vec();
        let output_reqs = reqs
            .iter_outputs()
            .map(|(idx, req)| (op.io.outputs[idx], req.clone()))
            .collect_vec();
        for (id, req) in input_reqs.into_iter().chain(output_reqs) {
            tensors.update_required_strides(id, &req);
        }
    }

    // Placement. I/O tensors get their slot index and a contiguous buffer
    // offset per direction; everything else follows in creation order, which
    // guarantees view parents are placed before their children.
    let mut allocator = Allocator::new(*resources);
    let mut slots = [0u32; 2];
    let mut offsets = [0u64; 2];
    for &id in &io_list {
        let size = align_up(tensors.total_byte_size(id), DATA_ALIGNMENT);
        let dir = match tensors.node(id).usage() {
            TensorUsage::Input => 0,
            TensorUsage::Output => 1,
            usage => panic!("tensor {} with usage {} in the I/O list", tensors.node(id).name(), usage),
        };
        allocator.allocate_io(tensors, id, slots[dir], offsets[dir]);
        slots[dir] += 1;
        offsets[dir] += size;
    }
    let all_ids = tensors.ids().collect_vec();
    for &id in &all_ids {
        if tensors.node(id).parent_view().is_some() {
            continue;
        }
        // Place each view family root-first so children can inherit their
        // parent's region.
        let mut family = Vec::new();
        tensors.for_each_view(id, &mut |t| {
            family.push(t);
            VisitAction::Descend
        });
        for &t in &family {
            match tensors.node(t).usage() {
                TensorUsage::Input | TensorUsage::Output => {}
                _ => allocator.allocate_data(tensors, t),
            }
        }
    }
    for &id in &all_ids {
        allocator.allocate_shape(tensors, id);
    }
    debug!(
        blob = allocator.blob_size(),
        bss = allocator.bss_size(),
        "placement complete"
    );

    for op in ops.iter_mut() {
        let OpNode { operation, io } = op;
        operation.finalize_layout(io, tensors);
    }

    // Validation failures are user-facing; leave no partial placement behind.
    for op in ops.iter() {
        if let Err(err) = op.operation.validate(&op.io, tensors) {
            let name = op.operation.name().to_string();
            for &id in &all_ids {
                tensors.clear_allocation(id);
            }
            return Err(err).with_context(|| format!("validating operation {}", name));
        }
    }

    for op in ops.iter() {
        let need = op.operation.compute_resource_need(&op.io, tensors);
        let mut batch = BatchInfo::for_io(&op.io);
        op.operation.report_batch_support(&op.io, &mut batch);
        debug!(op = %op.operation.name(), ?need, "compute-lane demand");
    }

    // Emission: the I/O directory first, then each operation's parameters
    // followed by its operand records.
    let mut writer = BlobWriter::new();
    for &id in &io_list {
        serialize::serialize_io_info(tensors, id, &mut writer);
    }
    for op in ops.iter() {
        op.operation.emit_parameters(&op.io, &mut writer);
        op.operation.emit_operands(&op.io, tensors, &mut writer);
    }
    debug!(bytes = writer.len(), "emitted program blob");
    Ok(writer.into_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ops::nms::{BoundedNms, NmsParams},
        testing,
    };

    fn build_nms_model(boxes: u64) -> Model {
        let (mut model, inputs, outputs) = testing::bounded_nms_fixture(boxes, 0.0);
        BoundedNms::build(
            &mut model,
            "nms",
            NmsParams {
                center_point_box: false,
                sort_result_descending: false,
            },
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();
        model
    }

    #[test]
    fn end_to_end_blob_is_deterministic() {
        let mut first = build_nms_model(1000);
        let mut second = build_nms_model(1000);
        let resources = Resources::default();
        let blob_a = compile(&mut first, &resources).unwrap();
        let blob_b = compile(&mut second, &resources).unwrap();
        assert!(!blob_a.is_empty());
        assert_eq!(blob_a, blob_b);
    }

    #[test]
    fn validation_failure_clears_placement() {
        let (mut model, mut inputs, outputs) = testing::bounded_nms_fixture(1000, 0.0);
        inputs[2] = model.tensors_mut().add(
            "bad-count",
            crate::model::TensorUsage::Input,
            testing::scalar(crate::descriptor::ElemType::Fp32),
        );
        BoundedNms::build(
            &mut model,
            "nms",
            NmsParams {
                center_point_box: false,
                sort_result_descending: false,
            },
            &inputs,
            outputs,
            &Resources::default(),
        )
        .unwrap();

        let err = compile(&mut model, &Resources::default()).unwrap_err();
        assert!(err.to_string().contains("nms"));
        let tensors = model.tensors();
        for id in tensors.ids().collect::<Vec<_>>() {
            assert_eq!(
                tensors.node(id).location().location,
                crate::alloc::Location::None
            );
        }
    }

    #[test]
    fn dynamic_output_resolves_both_locations() {
        let mut model = build_nms_model(1000);
        compile(&mut model, &Resources::default()).unwrap();

        let tensors = model.tensors();
        let indices = tensors
            .ids()
            .find(|id| tensors.node(*id).name() == "indices")
            .unwrap();
        let shape = tensors.node(indices).shape_location();
        assert_eq!(shape.dims_location, crate::alloc::Location::Output);
        assert!(tensors.node(indices).shape_upper_bound().is_some());
    }
}
