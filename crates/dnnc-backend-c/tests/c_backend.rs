use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use dnnc::backend::{BackendError, ExecutionBackend, ExecutionStrategy, TargetArch};
use dnnc::error::GraphError;
use dnnc::ops::OpKind;
use dnnc::tensor::{DType, Tensor, TensorValue};
use dnnc::{Graph, Params};
use dnnc_backend_c::{CBackend, CCompileOptions};
use dnnc_backend_ref_cpu::RefCpuBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn backend_in(dir: &Path) -> Arc<dyn ExecutionBackend> {
    let options = CCompileOptions::from_env().with_cache_dir(dir);
    Arc::new(CBackend::with_options(options))
}

fn feed(name: &str, value: TensorValue) -> HashMap<String, TensorValue> {
    HashMap::from([(name.to_string(), value)])
}

/// `x -> conv -> relu` on a compiled group.
fn conv_graph(backend: &Arc<dyn ExecutionBackend>) -> Result<Graph> {
    let mut graph = Graph::new().with_backend(ExecutionStrategy::Compiled, Arc::clone(backend));
    let g = graph.add_group(ExecutionStrategy::Compiled, TargetArch::Cpu);
    let x = graph.add_op("x", OpKind::data(&[2, 3, 8, 8], DType::F32), &[], g)?;
    let conv = graph.add_op("conv", OpKind::conv2d(4, 3, 1), &[x], g)?;
    graph.add_op("act", OpKind::relu(), &[conv], g)?;
    graph.build(&["act"])?;
    Ok(graph)
}

fn library_count(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with("dnnc_") && !name.ends_with(".c") {
            count += 1;
        }
    }
    Ok(count)
}

#[test]
fn compile_time_is_recorded_per_group() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let graph = conv_graph(&backend_in(dir.path()))?;
    let group = &graph.groups()[0];
    assert!(group.compile_time().is_some());
    assert_eq!(library_count(dir.path())?, 1);
    Ok(())
}

#[test]
fn identical_groups_share_one_module() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = backend_in(dir.path());
    let _first = conv_graph(&backend)?;
    let _second = conv_graph(&backend)?;
    assert_eq!(library_count(dir.path())?, 1);

    // A fresh backend finds the module on disk instead of recompiling.
    let _third = conv_graph(&backend_in(dir.path()))?;
    assert_eq!(library_count(dir.path())?, 1);
    Ok(())
}

#[test]
fn kept_source_lands_next_to_the_library() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut options = CCompileOptions::from_env().with_cache_dir(dir.path());
    options.keep_source = true;
    let backend: Arc<dyn ExecutionBackend> = Arc::new(CBackend::with_options(options));
    conv_graph(&backend)?;

    let sources: Vec<String> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".c"))
        .collect();
    assert_eq!(sources.len(), 1, "{sources:?}");
    let source = std::fs::read_to_string(dir.path().join(&sources[0]))?;
    assert!(source.contains("dnnc_entry"));
    Ok(())
}

#[test]
fn params_update_without_rebuild() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let backend = backend_in(dir.path());
    let mut compiled = conv_graph(&backend)?;

    let reference_backend: Arc<dyn ExecutionBackend> = Arc::new(RefCpuBackend::new());
    let mut reference = Graph::new().with_backend(ExecutionStrategy::Reference, reference_backend);
    let g = reference.add_group(ExecutionStrategy::Reference, TargetArch::Cpu);
    let x = reference.add_op("x", OpKind::data(&[2, 3, 8, 8], DType::F32), &[], g)?;
    let conv = reference.add_op("conv", OpKind::conv2d(4, 3, 1), &[x], g)?;
    reference.add_op("act", OpKind::relu(), &[conv], g)?;
    reference.build(&["act"])?;

    let mut rng = StdRng::seed_from_u64(11);
    let input: TensorValue = Tensor::<f32>::randn(&[2, 3, 8, 8], 0.0, 1.0, &mut rng).into();
    let before = compiled.run(&feed("x", input.clone()))?;
    assert!(before["act"].to_f64_vec().iter().all(|&v| v == 0.0));

    let mut params = Params::new();
    params.insert(
        "conv".to_string(),
        vec![
            Tensor::<f32>::randn(&[4, 3, 3, 3], 0.0, 0.5, &mut rng).into(),
            Tensor::<f32>::randn(&[4], 0.0, 0.1, &mut rng).into(),
        ],
    );
    compiled.set_params(&params)?;
    reference.set_params(&params)?;

    let got = compiled.run(&feed("x", input.clone()))?;
    let want = reference.run(&feed("x", input))?;
    dnnc_backend_tests::assert_close(&got["act"], &want["act"], 1e-4);
    assert_eq!(library_count(dir.path())?, 1, "parameter updates must not recompile");
    Ok(())
}

#[test]
fn external_layout_is_checked_before_the_call() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut graph = conv_graph(&backend_in(dir.path()))?;
    let wrong = TensorValue::zeros(DType::F32, &[2, 3, 8, 7]);
    let err = graph.run(&feed("x", wrong)).unwrap_err();
    assert!(
        matches!(err, GraphError::InputMismatch { .. } | GraphError::Backend(_)),
        "{err}"
    );
    Ok(())
}

#[test]
fn missing_compiler_is_a_compile_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut options = CCompileOptions::default().with_cache_dir(dir.path());
    options.compiler = dir.path().join("no-such-cc").to_string_lossy().into_owned();
    let backend: Arc<dyn ExecutionBackend> = Arc::new(CBackend::with_options(options));

    let err = conv_graph(&backend).unwrap_err();
    let err = err.downcast::<GraphError>()?;
    assert!(
        matches!(err, GraphError::Backend(BackendError::Compile { .. })),
        "{err}"
    );
    assert!(!err.is_unsupported());
    Ok(())
}

#[test]
fn openmp_build_matches_serial_build() -> Result<()> {
    let serial_dir = tempfile::tempdir()?;
    let parallel_dir = tempfile::tempdir()?;
    let mut options = CCompileOptions::from_env().with_cache_dir(parallel_dir.path());
    options.openmp = true;
    let parallel: Arc<dyn ExecutionBackend> = Arc::new(CBackend::with_options(options));

    let mut params = Params::new();
    let mut rng = StdRng::seed_from_u64(5);
    params.insert(
        "conv".to_string(),
        vec![
            Tensor::<f32>::randn(&[4, 3, 3, 3], 0.0, 0.5, &mut rng).into(),
            Tensor::<f32>::randn(&[4], 0.0, 0.1, &mut rng).into(),
        ],
    );
    let input: TensorValue = Tensor::<f32>::randn(&[2, 3, 8, 8], 0.0, 1.0, &mut rng).into();

    let mut serial = conv_graph(&backend_in(serial_dir.path()))?;
    serial.set_params(&params)?;
    let want = serial.run(&feed("x", input.clone()))?;

    let mut threaded = match conv_graph(&parallel) {
        Ok(graph) => graph,
        Err(err) => {
            // Toolchains without OpenMP support reject -fopenmp outright.
            eprintln!("skipping: {err}");
            return Ok(());
        }
    };
    threaded.set_params(&params)?;
    let got = threaded.run(&feed("x", input))?;
    assert_eq!(got["act"], want["act"]);
    Ok(())
}
