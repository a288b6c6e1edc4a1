use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dnnc::backend::{ExecutionBackend, ExecutionStrategy, TargetArch};
use dnnc::ops::OpKind;
use dnnc::tensor::{DType, Tensor, TensorValue};
use dnnc::Graph;
use dnnc_backend_c::{CBackend, CCompileOptions};
use dnnc_backend_ref_cpu::RefCpuBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

const DIMS: [usize; 4] = [2, 3, 4, 4];

/// `x -> act` in the first group; `sum = act + x` and `flat = flatten(x)` in the second.
fn two_stage(
    first: ExecutionStrategy,
    second: ExecutionStrategy,
    compiled: &Arc<dyn ExecutionBackend>,
) -> Result<Graph> {
    let reference: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut graph = Graph::new()
        .with_backend(ExecutionStrategy::Reference, reference)
        .with_backend(ExecutionStrategy::Compiled, Arc::clone(compiled));
    let g0 = graph.add_group(first, TargetArch::Cpu);
    let g1 = graph.add_group(second, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&DIMS, DType::F32), &[], g0)?;
    let act = graph.add_op("act", OpKind::leaky_relu(0.5), &[x], g0)?;
    graph.add_op("sum", OpKind::Sum, &[act, x], g1)?;
    graph.add_op("flat", OpKind::Flatten, &[x], g1)?;
    graph.build(&["sum", "flat"])?;
    Ok(graph)
}

#[test]
fn every_strategy_pairing_hands_off_between_groups() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let compiled: Arc<dyn ExecutionBackend> = Arc::new(CBackend::with_options(
        CCompileOptions::from_env().with_cache_dir(dir.path()),
    ));

    let mut rng = StdRng::seed_from_u64(21);
    let x = Tensor::<f32>::randn(&DIMS, 0.0, 1.0, &mut rng);
    let want_sum: Vec<f32> = x
        .data()
        .iter()
        .map(|&v| (if v > 0.0 { v } else { v * 0.5 }) + v)
        .collect();
    let feed = HashMap::from([("x".to_string(), TensorValue::from(x.clone()))]);

    let strategies = [ExecutionStrategy::Reference, ExecutionStrategy::Compiled];
    for first in strategies {
        for second in strategies {
            let mut graph = two_stage(first, second, &compiled)?;
            let once = graph.run(&feed)?;
            let twice = graph.run(&feed)?;
            assert_eq!(once, twice, "{first} -> {second}: runs differ");

            let sum = once["sum"].as_tensor::<f32>();
            assert_eq!(sum.dims(), &DIMS);
            for (got, want) in sum.data().iter().zip(&want_sum) {
                assert!((got - want).abs() <= 1e-6, "{first} -> {second}: {got} vs {want}");
            }

            let flat = once["flat"].as_tensor::<f32>();
            assert_eq!(flat.dims(), &[2, 48]);
            assert_eq!(flat.data(), x.data(), "{first} -> {second}");
        }
    }
    Ok(())
}
