//! CPU loop schedule: thread-parallel outer loops, vectorized inner loops.

use dnnc::backend::{BackendError, BackendResult, TargetArch};

use crate::ir::{Func, Program, Schedule};

/// Innermost extents above this get a SIMD pragma.
pub const VECTORIZE_THRESHOLD: usize = 8;

pub fn schedule_program(program: &mut Program, target: TargetArch) -> BackendResult<()> {
    if target != TargetArch::Cpu {
        return Err(BackendError::unsupported(
            "schedule",
            format!("no loop schedule for {} targets", target.as_str()),
        ));
    }
    for func in &mut program.funcs {
        func.schedule = cpu_schedule(func);
    }
    Ok(())
}

/// Batch loop (dim 0) and channel loop (dim 1) run in parallel when they have more than one
/// iteration; both together are collapsed into a single parallel loop.
fn cpu_schedule(func: &Func) -> Schedule {
    let dims = &func.dims;
    let batch = dims.first().is_some_and(|&n| n > 1);
    let channels = dims.get(1).is_some_and(|&c| c > 1);
    let parallel = match (batch, channels) {
        (true, true) => Some((0, 2)),
        (true, false) => Some((0, 1)),
        (false, true) => Some((1, 1)),
        (false, false) => None,
    };

    let innermost = dims.len().saturating_sub(1);
    let inside_parallel = parallel.is_some_and(|(start, count)| innermost < start + count);
    let vectorize =
        !inside_parallel && dims.last().is_some_and(|&extent| extent > VECTORIZE_THRESHOLD);

    Schedule {
        parallel,
        vectorize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Expr, FuncId, Storage};
    use dnnc::tensor::DType;

    fn func(dims: &[usize]) -> Func {
        Func {
            id: FuncId(0),
            name: "f0".to_string(),
            op: None,
            dtype: DType::F32,
            dims: dims.to_vec(),
            body: Expr::Const(0.0),
            storage: Storage::Scratch,
            schedule: Schedule::default(),
        }
    }

    #[test]
    fn batch_and_channel_loops_are_collapsed() {
        let schedule = cpu_schedule(&func(&[4, 16, 32, 32]));
        assert_eq!(schedule.parallel, Some((0, 2)));
        assert!(schedule.vectorize);
    }

    #[test]
    fn single_image_parallelises_channels_only() {
        let schedule = cpu_schedule(&func(&[1, 16, 8, 8]));
        assert_eq!(schedule.parallel, Some((1, 1)));
        assert!(!schedule.vectorize, "extent 8 is not above the threshold");
    }

    #[test]
    fn single_channel_parallelises_batch_only() {
        assert_eq!(cpu_schedule(&func(&[3, 1, 9])).parallel, Some((0, 1)));
        assert_eq!(cpu_schedule(&func(&[1, 1])).parallel, None);
    }

    #[test]
    fn parallel_innermost_loop_is_not_vectorized() {
        let schedule = cpu_schedule(&func(&[2, 100]));
        assert_eq!(schedule.parallel, Some((0, 2)));
        assert!(!schedule.vectorize);
    }

    #[test]
    fn gpu_target_has_no_schedule() {
        let mut program = Program {
            inputs: Vec::new(),
            params: Vec::new(),
            funcs: vec![func(&[2, 2])],
        };
        let err = schedule_program(&mut program, TargetArch::Gpu).unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { .. }));
    }
}
