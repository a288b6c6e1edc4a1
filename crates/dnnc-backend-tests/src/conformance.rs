//! Whole-network comparisons of a backend against the reference backend.

use std::collections::HashMap;
use std::sync::Arc;

use dnnc::backend::{ExecutionBackend, ExecutionStrategy, TargetArch};
use dnnc::graph::{Graph, GroupId};
use dnnc::ops::{OpId, OpKind};
use dnnc::params::Params;
use dnnc::tensor::{DType, Tensor, TensorValue};
use dnnc_backend_ref_cpu::RefCpuBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{assert_close, graph_with};

const FLOAT_OUTPUTS: [&str; 3] = ["prob", "res", "flat"];

/// Conv stem, normalization, a two-branch concat and a classifier head, split over two groups.
fn float_network(graph: &mut Graph, strategy: ExecutionStrategy, dtype: DType) {
    let stem = graph.add_group(strategy, TargetArch::Cpu);
    let head = graph.add_group(strategy, TargetArch::Cpu);
    let mut add = |name: &str, kind: OpKind, inputs: &[OpId], group: GroupId| {
        graph.add_op(name, kind, inputs, group).unwrap()
    };

    let x = add("x", OpKind::data(&[2, 3, 12, 12], dtype), &[], stem);
    let c1 = add("c1", OpKind::conv2d(8, 3, 1), &[x], stem);
    let r1 = add("r1", OpKind::relu(), &[c1], stem);
    let p1 = add("p1", OpKind::max_pool(3, 2), &[r1], stem);
    let n1 = add("n1", OpKind::lrn(5, 1e-2, 0.75), &[p1], stem);

    let b1 = add("b1", OpKind::conv2d(4, 1, 1), &[n1], head);
    let b2 = add("b2", OpKind::conv2d(4, 3, 1), &[n1], head);
    let cat = add("cat", OpKind::Concat, &[b1, b2], head);
    let bn = add("bn", OpKind::batch_norm(1e-5), &[cat], head);
    let sc = add("sc", OpKind::scale(true), &[bn], head);
    let lr = add("lr", OpKind::leaky_relu(0.1), &[sc], head);
    let res = add("res", OpKind::Sum, &[lr, p1], head);
    let ap = add("ap", OpKind::avg_pool(2, 2), &[res], head);
    let flat = add("flat", OpKind::Flatten, &[ap], head);
    let fc = add("fc", OpKind::affine(10), &[flat], head);
    add("prob", OpKind::Softmax, &[fc], head);
}

fn random_float(
    dtype: DType,
    dims: &[usize],
    mean: f32,
    std: f32,
    rng: &mut StdRng,
) -> TensorValue {
    match dtype {
        DType::F64 => Tensor::<f64>::randn(dims, mean, std, rng).into(),
        _ => Tensor::<f32>::randn(dims, mean, std, rng).into(),
    }
}

fn constant(dtype: DType, dims: &[usize], value: f64) -> TensorValue {
    match dtype {
        DType::F64 => Tensor::full(dims, value).into(),
        _ => Tensor::full(dims, value as f32).into(),
    }
}

/// Draws every parameter of `graph`, keeping variances positive.
fn random_params(graph: &Graph, dtype: DType, rng: &mut StdRng) -> Params {
    let mut params = graph.extract_params();
    for (name, tensors) in params.iter_mut() {
        let is_batch_norm = matches!(
            graph.op_by_name(name).map(|op| op.kind()),
            Some(OpKind::BatchNorm(_))
        );
        for (slot, tensor) in tensors.iter_mut().enumerate() {
            let dims = tensor.dims().to_vec();
            *tensor = match (is_batch_norm, slot) {
                (true, 0) => random_float(dtype, &dims, 0.0, 0.3, rng),
                (true, 1) => random_float(dtype, &dims, 1.5, 0.2, rng),
                (true, _) => constant(dtype, &dims, 2.0),
                _ => random_float(dtype, &dims, 0.0, 0.4, rng),
            };
        }
    }
    params
}

fn run_pair(
    strategy: ExecutionStrategy,
    backend: &Arc<dyn ExecutionBackend>,
    build: impl Fn(&mut Graph, ExecutionStrategy),
    outputs: &[&str],
    params: impl FnOnce(&Graph) -> Params,
    feed: &HashMap<String, TensorValue>,
) -> (HashMap<String, TensorValue>, HashMap<String, TensorValue>) {
    let reference_backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut reference = graph_with(ExecutionStrategy::Reference, &reference_backend);
    build(&mut reference, ExecutionStrategy::Reference);
    reference.build(outputs).unwrap();

    let mut candidate = graph_with(strategy, backend);
    build(&mut candidate, strategy);
    candidate.build(outputs).unwrap();

    let params = params(&reference);
    reference.set_params(&params).unwrap();
    candidate.set_params(&params).unwrap();

    (candidate.run(feed).unwrap(), reference.run(feed).unwrap())
}

fn float_network_matches(
    strategy: ExecutionStrategy,
    backend: &Arc<dyn ExecutionBackend>,
    dtype: DType,
) {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut feed = HashMap::new();
    feed.insert(
        "x".to_string(),
        random_float(dtype, &[2, 3, 12, 12], 0.0, 1.0, &mut rng),
    );

    let (actual, expected) = run_pair(
        strategy,
        backend,
        |graph, strategy| float_network(graph, strategy, dtype),
        &FLOAT_OUTPUTS,
        |graph| random_params(graph, dtype, &mut rng),
        &feed,
    );
    let tolerance = match dtype {
        DType::F64 => 1e-12,
        _ => 1e-5,
    };
    assert_eq!(actual.len(), FLOAT_OUTPUTS.len());
    for name in FLOAT_OUTPUTS {
        assert_close(&actual[name], &expected[name], tolerance);
    }
}

pub fn float_network_matches_reference(
    strategy: ExecutionStrategy,
    backend: &Arc<dyn ExecutionBackend>,
) {
    float_network_matches(strategy, backend, DType::F32);
}

pub fn double_network_matches_reference(
    strategy: ExecutionStrategy,
    backend: &Arc<dyn ExecutionBackend>,
) {
    float_network_matches(strategy, backend, DType::F64);
}

pub fn integer_network_matches_reference(
    strategy: ExecutionStrategy,
    backend: &Arc<dyn ExecutionBackend>,
) {
    let mut rng = StdRng::seed_from_u64(17);
    let mut random_ints = |dims: &[usize]| {
        let len: usize = dims.iter().product();
        let data: Vec<i32> = (0..len).map(|_| rng.gen_range(-50..50)).collect();
        TensorValue::from(Tensor::from_vec(dims, data).unwrap())
    };
    let mut feed = HashMap::new();
    feed.insert("x".to_string(), random_ints(&[2, 3, 5, 5]));
    feed.insert("y".to_string(), random_ints(&[2, 3, 5, 5]));

    let build = |graph: &mut Graph, strategy: ExecutionStrategy| {
        let g = graph.add_group(strategy, TargetArch::Cpu);
        let x = graph.add_op("x", OpKind::data(&[2, 3, 5, 5], DType::I32), &[], g).unwrap();
        let y = graph.add_op("y", OpKind::data(&[2, 3, 5, 5], DType::I32), &[], g).unwrap();
        let s = graph.add_op("s", OpKind::Sum, &[x, y], g).unwrap();
        let r = graph.add_op("r", OpKind::relu(), &[s], g).unwrap();
        let mp = graph.add_op("mp", OpKind::max_pool(3, 2), &[r], g).unwrap();
        let cat = graph.add_op("cat", OpKind::Concat, &[mp, mp], g).unwrap();
        graph.add_op("flat", OpKind::Flatten, &[cat], g).unwrap();
    };

    let (actual, expected) = run_pair(
        strategy,
        backend,
        build,
        &["s", "flat"],
        |_| Params::new(),
        &feed,
    );
    assert_eq!(actual["s"], expected["s"]);
    assert_eq!(actual["flat"], expected["flat"]);
    assert_eq!(actual["flat"].dims(), &[2, 54]);
}
