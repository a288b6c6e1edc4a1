use std::collections::HashSet;

use anyhow::Result;
use dnnc::backend::{BackendError, ExecutionStrategy, GroupView, TargetArch};
use dnnc::graph::plan_group;
use dnnc::ops::{OpId, OpKind};
use dnnc::tensor::DType;
use dnnc::{Graph, GroupId};
use dnnc_backend_c::{emit_group_source, VECTORIZE_THRESHOLD};

fn source_for(
    graph: &Graph,
    group: GroupId,
    target: TargetArch,
    outputs: &[&str],
) -> Result<String, BackendError> {
    let requested: HashSet<OpId> = outputs
        .iter()
        .map(|name| graph.op_id(name).expect("output exists"))
        .collect();
    let members = graph.group(group).expect("group exists").members();
    let plan = plan_group(graph.arena(), group, members, &requested).expect("plan");
    let view = GroupView {
        id: group,
        name: "group0",
        target,
        plan: &plan,
        arena: graph.arena(),
    };
    emit_group_source(&view)
}

fn conv_pool(batch: usize, channels: usize, width: usize) -> Result<(Graph, GroupId)> {
    let mut graph = Graph::new();
    let g = graph.add_group(ExecutionStrategy::Compiled, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[batch, 3, width, width], DType::F32), &[], g)?;
    let conv = graph.add_op("conv", OpKind::conv2d(channels, 3, 1), &[x], g)?;
    graph.add_op("pool", OpKind::max_pool(2, 2), &[conv], g)?;
    Ok((graph, g))
}

#[test]
fn batch_and_channels_share_a_collapsed_parallel_loop() -> Result<()> {
    let (graph, g) = conv_pool(4, 8, 16)?;
    let source = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    assert!(source.contains("#pragma omp parallel for collapse(2)"));
    assert!(source.contains("#pragma omp simd"), "width 16 > {VECTORIZE_THRESHOLD}");
    assert!(source.contains(
        "int dnnc_entry(const void* const* inputs, const void* const* params, void* const* outputs)"
    ));
    Ok(())
}

#[test]
fn narrow_rows_are_not_vectorized() -> Result<()> {
    let (graph, g) = conv_pool(1, 8, VECTORIZE_THRESHOLD)?;
    let source = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    assert!(source.contains("#pragma omp parallel for\n"));
    assert!(!source.contains("collapse"));
    assert!(!source.contains("#pragma omp simd"));
    Ok(())
}

#[test]
fn intermediates_use_scratch_and_outputs_use_caller_buffers() -> Result<()> {
    let (graph, g) = conv_pool(2, 4, 8)?;
    let source = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    assert!(source.contains("float* s0 = NULL;"));
    assert!(source.contains("s0 = (float*)malloc(512 * sizeof(float));"));
    assert!(source.contains("float* out0 = (float*)outputs[0];"));
    assert!(source.contains("free(s0);"));
    assert!(source.contains("const float* p0 = (const float*)params[0];"));
    assert!(source.contains("const float* p1 = (const float*)params[1];"));

    let both = source_for(&graph, g, TargetArch::Cpu, &["conv", "pool"])?;
    assert!(!both.contains("malloc"));
    assert!(both.contains("float* out1 = (float*)outputs[1];"));
    Ok(())
}

#[test]
fn generated_source_is_deterministic() -> Result<()> {
    let (graph, g) = conv_pool(2, 4, 8)?;
    let a = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    let b = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn max_pool_starts_from_the_lowest_value() -> Result<()> {
    let (graph, g) = conv_pool(2, 4, 8)?;
    let source = source_for(&graph, g, TargetArch::Cpu, &["pool"])?;
    assert!(source.contains("= -FLT_MAX;"));

    let mut ints = Graph::new();
    let g = ints.add_group(ExecutionStrategy::Compiled, TargetArch::Cpu);
    let x = ints.add_op("x", OpKind::data(&[1, 2, 4, 4], DType::I16), &[], g)?;
    ints.add_op("pool", OpKind::max_pool(3, 1), &[x], g)?;
    let source = source_for(&ints, g, TargetArch::Cpu, &["pool"])?;
    assert!(source.contains("= INT16_MIN;"));
    Ok(())
}

#[test]
fn gpu_target_is_rejected() -> Result<()> {
    let (graph, g) = conv_pool(2, 4, 8)?;
    let err = source_for(&graph, g, TargetArch::Gpu, &["pool"]).unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { .. }));
    Ok(())
}
