use std::sync::Arc;

use dnnc::backend::{ExecutionBackend, ExecutionStrategy, TargetArch};
use dnnc::ops::OpKind;
use dnnc::params::Params;
use dnnc::tensor::{DType, Tensor, TensorValue};

use crate::{assert_close, graph_with, inputs};

fn f32_value(dims: &[usize], data: Vec<f32>) -> TensorValue {
    TensorValue::from(Tensor::from_vec(dims, data).unwrap())
}

pub fn sum_of_ones_is_two(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let a = graph.add_op("a", OpKind::data(&[1024], DType::F32), &[], g).unwrap();
    let b = graph.add_op("b", OpKind::data(&[1024], DType::F32), &[], g).unwrap();
    graph.add_op("sum", OpKind::Sum, &[a, b], g).unwrap();
    graph.build(&["sum"]).unwrap();

    let ones = TensorValue::from(Tensor::full(&[1024], 1.0f32));
    let out = graph
        .run(&inputs([("a", ones.clone()), ("b", ones)]))
        .unwrap();
    let sum = out["sum"].as_tensor::<f32>();
    assert_eq!(sum.dims(), &[1024]);
    assert!(sum.data().iter().all(|&v| v == 2.0));
}

pub fn integer_sum_is_exact(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let a = graph.add_op("a", OpKind::data(&[2, 3], DType::I32), &[], g).unwrap();
    let b = graph.add_op("b", OpKind::data(&[2, 3], DType::I32), &[], g).unwrap();
    let c = graph.add_op("c", OpKind::data(&[2, 3], DType::I32), &[], g).unwrap();
    graph.add_op("total", OpKind::Sum, &[a, b, c], g).unwrap();
    graph.build(&["total"]).unwrap();

    let value = |data: Vec<i32>| TensorValue::from(Tensor::from_vec(&[2, 3], data).unwrap());
    let out = graph
        .run(&inputs([
            ("a", value(vec![1, 2, 3, 4, 5, 6])),
            ("b", value(vec![1_000_000, -7, 0, 0, 9, -6])),
            ("c", value(vec![-1, 5, 100, 2_000_000_000, 0, 0])),
        ]))
        .unwrap();
    assert_eq!(
        out["total"].as_tensor::<i32>().data(),
        &[1_000_000, 0, 103, 2_000_000_004, 14, 0]
    );
}

pub fn affine_matches_expected(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[2, 3], DType::F32), &[], g).unwrap();
    graph.add_op("fc", OpKind::affine(2), &[x], g).unwrap();
    graph.build(&["fc"]).unwrap();

    let mut params = Params::new();
    params.insert(
        "fc".to_string(),
        vec![
            f32_value(&[2, 3], vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5]),
            f32_value(&[2], vec![1.0, -1.0]),
        ],
    );
    graph.set_params(&params).unwrap();

    let out = graph
        .run(&inputs([("x", f32_value(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))]))
        .unwrap();
    assert_close(
        &out["fc"],
        &f32_value(&[2, 2], vec![-1.0, 2.0, -1.0, 6.5]),
        1e-6,
    );
}

pub fn conv_of_ones_counts_taps(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 3, 5, 5], DType::F32), &[], g).unwrap();
    graph.add_op("conv", OpKind::conv2d(2, 3, 1), &[x], g).unwrap();
    graph.build(&["conv"]).unwrap();

    let mut params = Params::new();
    params.insert(
        "conv".to_string(),
        vec![
            TensorValue::from(Tensor::full(&[2, 3, 3, 3], 1.0f32)),
            f32_value(&[2], vec![0.5, -1.0]),
        ],
    );
    graph.set_params(&params).unwrap();

    let out = graph
        .run(&inputs([("x", TensorValue::from(Tensor::full(&[1, 3, 5, 5], 1.0f32)))]))
        .unwrap();
    let conv = out["conv"].as_tensor::<f32>();
    assert_eq!(conv.dims(), &[1, 2, 5, 5]);
    for (filter, bias) in [(0usize, 0.5f32), (1, -1.0)] {
        assert_eq!(conv[[0, filter, 0, 0]], 12.0 + bias);
        assert_eq!(conv[[0, filter, 0, 2]], 18.0 + bias);
        assert_eq!(conv[[0, filter, 2, 2]], 27.0 + bias);
        assert_eq!(conv[[0, filter, 4, 4]], 12.0 + bias);
    }
}

pub fn strided_conv_shape(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[2, 3, 9, 9], DType::F32), &[], g).unwrap();
    graph.add_op("conv", OpKind::conv2d(4, 3, 2), &[x], g).unwrap();
    graph.build(&["conv"]).unwrap();

    let out = graph
        .run(&inputs([("x", TensorValue::from(Tensor::full(&[2, 3, 9, 9], 1.0f32)))]))
        .unwrap();
    assert_eq!(out["conv"].dims(), &[2, 4, 5, 5]);
    assert!(out["conv"].to_f64_vec().iter().all(|&v| v == 0.0));
}

pub fn pooling_matches_expected(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 1, 4, 4], DType::F32), &[], g).unwrap();
    graph.add_op("max", OpKind::max_pool(2, 2), &[x], g).unwrap();
    graph.add_op("avg", OpKind::avg_pool(2, 2), &[x], g).unwrap();
    graph.build(&["max", "avg"]).unwrap();

    let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
    let out = graph
        .run(&inputs([("x", f32_value(&[1, 1, 4, 4], data))]))
        .unwrap();
    assert_eq!(out["max"].as_tensor::<f32>().data(), &[5.0, 7.0, 13.0, 15.0]);
    assert_eq!(out["avg"].as_tensor::<f32>().data(), &[2.5, 4.5, 10.5, 12.5]);
}

pub fn softmax_rows_sum_to_one(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[3, 10], DType::F32), &[], g).unwrap();
    graph.add_op("prob", OpKind::Softmax, &[x], g).unwrap();
    graph.build(&["prob"]).unwrap();

    let data: Vec<f32> = (0..30).map(|v| (v as f32 * 0.37).sin() * 20.0).collect();
    let out = graph.run(&inputs([("x", f32_value(&[3, 10], data))])).unwrap();
    let prob = out["prob"].as_tensor::<f32>();
    for row in prob.data().chunks(10) {
        let total: f32 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-5, "row sums to {total}");
        assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }
}

pub fn lrn_matches_closed_form(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 3, 1, 1], DType::F32), &[], g).unwrap();
    graph.add_op("norm", OpKind::lrn(3, 3.0, 0.75), &[x], g).unwrap();
    graph.build(&["norm"]).unwrap();

    let out = graph
        .run(&inputs([("x", f32_value(&[1, 3, 1, 1], vec![1.0, 2.0, 3.0]))]))
        .unwrap();
    let expected: Vec<f32> = [(1.0f32, 5.0f32), (2.0, 14.0), (3.0, 13.0)]
        .iter()
        .map(|&(v, sq)| v / (1.0 + sq).powf(0.75))
        .collect();
    assert_close(&out["norm"], &f32_value(&[1, 3, 1, 1], expected), 1e-5);
}

pub fn normalization_chain(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 2, 1, 2], DType::F32), &[], g).unwrap();
    let bn = graph.add_op("bn", OpKind::batch_norm(0.0), &[x], g).unwrap();
    let sc = graph.add_op("sc", OpKind::scale(true), &[bn], g).unwrap();
    graph.add_op("act", OpKind::relu(), &[sc], g).unwrap();
    graph.build(&["act"]).unwrap();

    let mut params = Params::new();
    params.insert(
        "bn".to_string(),
        vec![
            f32_value(&[2], vec![2.0, -4.0]),
            f32_value(&[2], vec![8.0, 2.0]),
            f32_value(&[1], vec![2.0]),
        ],
    );
    params.insert(
        "sc".to_string(),
        vec![f32_value(&[2], vec![2.0, -1.0]), f32_value(&[2], vec![1.0, 0.0])],
    );
    graph.set_params(&params).unwrap();

    let out = graph
        .run(&inputs([("x", f32_value(&[1, 2, 1, 2], vec![5.0, -1.0, 0.0, 3.0]))]))
        .unwrap();
    // channel 0: (x - 1) / 2 * 2 + 1; channel 1: -(x + 2) / 1, clamped at zero.
    assert_close(
        &out["act"],
        &f32_value(&[1, 2, 1, 2], vec![5.0, 0.0, 0.0, 0.0]),
        1e-6,
    );

    let out = graph
        .run(&inputs([("x", f32_value(&[1, 2, 1, 2], vec![1.0, 1.0, -3.0, -5.0]))]))
        .unwrap();
    assert_close(
        &out["act"],
        &f32_value(&[1, 2, 1, 2], vec![1.0, 1.0, 1.0, 3.0]),
        1e-6,
    );
}

pub fn concat_then_flatten(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let a = graph.add_op("a", OpKind::data(&[2, 1, 1, 2], DType::F32), &[], g).unwrap();
    let b = graph.add_op("b", OpKind::data(&[2, 2, 1, 2], DType::F32), &[], g).unwrap();
    let cat = graph.add_op("cat", OpKind::Concat, &[a, b], g).unwrap();
    graph.add_op("flat", OpKind::Flatten, &[cat], g).unwrap();
    graph.build(&["cat", "flat"]).unwrap();

    let out = graph
        .run(&inputs([
            ("a", f32_value(&[2, 1, 1, 2], vec![1.0, 2.0, 3.0, 4.0])),
            (
                "b",
                f32_value(&[2, 2, 1, 2], vec![10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0]),
            ),
        ]))
        .unwrap();
    assert_eq!(out["cat"].dims(), &[2, 3, 1, 2]);
    assert_eq!(out["flat"].dims(), &[2, 6]);
    assert_eq!(
        out["flat"].as_tensor::<f32>().data(),
        &[1.0, 2.0, 10.0, 11.0, 12.0, 13.0, 3.0, 4.0, 20.0, 21.0, 22.0, 23.0]
    );
}

pub fn run_is_idempotent(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 2, 6, 6], DType::F32), &[], g).unwrap();
    let conv = graph.add_op("conv", OpKind::conv2d(3, 3, 1), &[x], g).unwrap();
    let act = graph.add_op("act", OpKind::leaky_relu(0.1), &[conv], g).unwrap();
    graph.add_op("pool", OpKind::max_pool(3, 2), &[act], g).unwrap();
    graph.build(&["pool"]).unwrap();

    let mut params = graph.extract_params();
    for (slot, tensor) in params.get_mut("conv").unwrap().iter_mut().enumerate() {
        let len = tensor.len();
        let data = (0..len).map(|i| ((i + slot) % 7) as f32 * 0.25 - 0.5).collect();
        *tensor = f32_value(tensor.dims(), data);
    }
    graph.set_params(&params).unwrap();

    let data: Vec<f32> = (0..72).map(|i| (i % 11) as f32 - 5.0).collect();
    let feed = inputs([("x", f32_value(&[1, 2, 6, 6], data))]);
    let first = graph.run(&feed).unwrap();
    let second = graph.run(&feed).unwrap();
    assert_eq!(first["pool"], second["pool"]);
}

pub fn params_update_after_build(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 2], DType::F32), &[], g).unwrap();
    graph.add_op("fc", OpKind::affine(1), &[x], g).unwrap();
    graph.build(&["fc"]).unwrap();

    let feed = inputs([("x", f32_value(&[1, 2], vec![3.0, 4.0]))]);
    let before = graph.run(&feed).unwrap();
    assert_eq!(before["fc"].as_tensor::<f32>().data(), &[0.0]);

    let mut params = Params::new();
    params.insert(
        "fc".to_string(),
        vec![f32_value(&[1, 2], vec![1.0, 2.0]), f32_value(&[1], vec![0.5])],
    );
    graph.set_params(&params).unwrap();
    let after = graph.run(&feed).unwrap();
    assert_eq!(after["fc"].as_tensor::<f32>().data(), &[11.5]);
    assert_eq!(graph.extract_params()["fc"], params["fc"]);
}

pub fn multi_group_handoff(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let first = graph.add_group(strategy, TargetArch::Cpu);
    let second = graph.add_group(strategy, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 1, 2, 2], DType::F32), &[], first).unwrap();
    let act = graph.add_op("act", OpKind::leaky_relu(0.5), &[x], first).unwrap();
    let pooled = graph.add_op("pooled", OpKind::avg_pool(2, 2), &[act], second).unwrap();
    graph.add_op("both", OpKind::Sum, &[pooled, pooled], second).unwrap();
    graph.build(&["both"]).unwrap();

    let first_plan = graph.plan(first).unwrap();
    assert_eq!(first_plan.outputs, vec![act]);
    let second_plan = graph.plan(second).unwrap();
    assert_eq!(second_plan.external, vec![act]);

    let out = graph
        .run(&inputs([("x", f32_value(&[1, 1, 2, 2], vec![-4.0, 2.0, 6.0, 8.0]))]))
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out["both"].as_tensor::<f32>().data(), &[7.0]);
}

pub fn gpu_target_is_unsupported(strategy: ExecutionStrategy, backend: &Arc<dyn ExecutionBackend>) {
    let mut graph = graph_with(strategy, backend);
    let g = graph.add_group(strategy, TargetArch::Gpu);
    let x = graph.add_op("x", OpKind::data(&[4], DType::F32), &[], g).unwrap();
    graph.add_op("act", OpKind::relu(), &[x], g).unwrap();
    let err = graph.build(&["act"]).unwrap_err();
    assert!(err.is_unsupported(), "{err}");
    assert!(!graph.is_built());
}
