use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dnnc::backend::registry;
use dnnc::backend::{ExecutionBackend, ExecutionStrategy, TargetArch};
use dnnc::ops::OpKind;
use dnnc::tensor::{DType, Tensor, TensorValue};
use dnnc::{Graph, Params};
use dnnc_backend_ref_cpu::{register_ref_cpu_backend, RefCpuBackend};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn feed(entries: Vec<(&str, TensorValue)>) -> HashMap<String, TensorValue> {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

#[test]
fn registered_backend_serves_reference_groups() -> Result<()> {
    register_ref_cpu_backend();
    assert!(registry::has_backend(ExecutionStrategy::Reference));
    assert!(registry::list_backends().contains(&ExecutionStrategy::Reference));

    let mut graph = Graph::new();
    let g = graph.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[3], DType::F32), &[], g)?;
    graph.add_op("act", OpKind::relu(), &[x], g)?;
    graph.build(&["act"])?;

    let input = TensorValue::from(Tensor::from_vec(&[3], vec![-1.0f32, 0.0, 2.0])?);
    let out = graph.run(&feed(vec![("x", input)]))?;
    assert_eq!(out["act"].as_tensor::<f32>().data(), &[0.0, 0.0, 2.0]);
    Ok(())
}

#[test]
fn integer_sum_wraps_on_overflow() -> Result<()> {
    let backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut graph = Graph::new().with_backend(ExecutionStrategy::Reference, backend);
    let g = graph.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let a = graph.add_op("a", OpKind::data(&[2], DType::U8), &[], g)?;
    let b = graph.add_op("b", OpKind::data(&[2], DType::U8), &[], g)?;
    graph.add_op("sum", OpKind::Sum, &[a, b], g)?;
    graph.build(&["sum"])?;

    let out = graph.run(&feed(vec![
        ("a", Tensor::from_vec(&[2], vec![250u8, 3])?.into()),
        ("b", Tensor::from_vec(&[2], vec![10u8, 4])?.into()),
    ]))?;
    assert_eq!(out["sum"].as_tensor::<u8>().data(), &[4, 7]);
    Ok(())
}

#[test]
fn double_precision_affine() -> Result<()> {
    let backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut graph = Graph::new().with_backend(ExecutionStrategy::Reference, backend);
    let g = graph.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 4], DType::F64), &[], g)?;
    graph.add_op("fc", OpKind::affine(3), &[x], g)?;
    graph.build(&["fc"])?;

    let mut rng = StdRng::seed_from_u64(3);
    let weight = Tensor::<f64>::randn(&[3, 4], 0.0, 1.0, &mut rng);
    let bias = Tensor::<f64>::randn(&[3], 0.0, 1.0, &mut rng);
    let input = Tensor::<f64>::randn(&[1, 4], 0.0, 1.0, &mut rng);

    let mut params = Params::new();
    params.insert(
        "fc".to_string(),
        vec![weight.clone().into(), bias.clone().into()],
    );
    graph.set_params(&params)?;
    let out = graph.run(&feed(vec![("x", input.clone().into())]))?;

    let fc = out["fc"].as_tensor::<f64>();
    for u in 0..3 {
        let dot: f64 = (0..4).map(|k| input[[0, k]] * weight[[u, k]]).sum();
        let expected = bias[[u]] + dot;
        assert!((fc[[0, u]] - expected).abs() < 1e-12);
    }
    Ok(())
}

#[test]
fn missing_input_is_reported_by_name() -> Result<()> {
    let backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut graph = Graph::new().with_backend(ExecutionStrategy::Reference, backend);
    let g = graph.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let x = graph.add_op("image", OpKind::data(&[1, 1, 2, 2], DType::F32), &[], g)?;
    graph.add_op("pool", OpKind::max_pool(2, 2), &[x], g)?;
    graph.build(&["pool"])?;

    let err = graph.run(&HashMap::new()).unwrap_err();
    assert!(err.to_string().contains("image"), "{err}");

    let wrong = TensorValue::zeros(DType::F32, &[1, 1, 3, 3]);
    let err = graph.run(&feed(vec![("image", wrong)])).unwrap_err();
    assert!(matches!(err, dnnc::GraphError::InputMismatch { .. }), "{err}");
    Ok(())
}

#[test]
fn initialize_params_leaves_built_groups_untouched() -> Result<()> {
    let backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut graph = Graph::new().with_backend(ExecutionStrategy::Reference, backend);
    let g = graph.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[1, 2], DType::F32), &[], g)?;
    graph.add_op("sc", OpKind::scale(false), &[x], g)?;
    graph.build(&["sc"])?;

    let mut params = Params::new();
    params.insert(
        "sc".to_string(),
        vec![Tensor::from_vec(&[2], vec![2.0f32, 3.0])?.into()],
    );
    graph.initialize_params(&params)?;
    let input: TensorValue = Tensor::from_vec(&[1, 2], vec![1.0f32, 1.0])?.into();
    let out = graph.run(&feed(vec![("x", input.clone())]))?;
    assert_eq!(out["sc"].as_tensor::<f32>().data(), &[0.0, 0.0]);

    graph.set_params(&params)?;
    let out = graph.run(&feed(vec![("x", input)]))?;
    assert_eq!(out["sc"].as_tensor::<f32>().data(), &[2.0, 3.0]);
    Ok(())
}
