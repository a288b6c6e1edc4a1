use std::collections::HashMap;

use dnnc::backend::{
    BackendError, BackendResult, CompiledGroup, ExecutionBackend, GroupView, TargetArch,
};
use dnnc::ops::{OpId, OpKind, PoolKind};
use dnnc::profiling;
use dnnc::tensor::{DType, Element, Tensor, TensorValue};

use crate::kernels;

/// Evaluates every op directly, one kernel call per op, on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefCpuBackend;

impl RefCpuBackend {
    pub fn new() -> Self {
        RefCpuBackend
    }
}

impl ExecutionBackend for RefCpuBackend {
    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn build_group(&self, group: &GroupView<'_>) -> BackendResult<Box<dyn CompiledGroup>> {
        if group.target != TargetArch::Cpu {
            return Err(BackendError::unsupported(
                "group",
                format!(
                    "the reference backend only targets cpu, {} asked for {}",
                    group.name, group.target
                ),
            ));
        }

        let mut steps = Vec::with_capacity(group.plan.order.len());
        let mut values = Vec::with_capacity(group.plan.order.len());
        let mut index = HashMap::with_capacity(group.plan.order.len());
        for (id, node) in group.ordered() {
            let operands = match node.kind() {
                OpKind::Data(_) => vec![external_operand(group, id, node.name())?],
                _ => node
                    .inputs()
                    .iter()
                    .map(|&input| match index.get(&input) {
                        Some(&local) => Ok(Operand::Local(local)),
                        None => external_operand(group, input, node.name()),
                    })
                    .collect::<BackendResult<Vec<_>>>()?,
            };
            index.insert(id, steps.len());
            values.push(TensorValue::zeros(node.dtype(), node.dims()));
            steps.push(Step {
                name: node.name().to_string(),
                kind: node.kind().clone(),
                dtype: node.dtype(),
                operands,
                params: node.params().to_vec(),
            });
        }
        log::debug!(
            "{}: prepared {} reference kernels over {} external tensors",
            group.name,
            steps.len(),
            group.plan.external.len()
        );

        Ok(Box::new(RefCpuGroup {
            steps,
            values,
            index,
            external_len: group.plan.external.len(),
        }))
    }
}

fn external_operand(group: &GroupView<'_>, id: OpId, consumer: &str) -> BackendResult<Operand> {
    group.external_slot(id).map(Operand::External).ok_or_else(|| {
        BackendError::execution(format!(
            "{consumer} reads {} which the plan does not bind",
            group.node(id).name()
        ))
    })
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    /// Position in the caller-supplied external list.
    External(usize),
    /// Result of an earlier step of the same group.
    Local(usize),
}

struct Step {
    name: String,
    kind: OpKind,
    dtype: DType,
    operands: Vec<Operand>,
    params: Vec<TensorValue>,
}

/// A group prepared for direct evaluation: one preallocated result per member op.
pub struct RefCpuGroup {
    steps: Vec<Step>,
    values: Vec<TensorValue>,
    index: HashMap<OpId, usize>,
    external_len: usize,
}

impl CompiledGroup for RefCpuGroup {
    fn run(&mut self, external: &[&TensorValue]) -> BackendResult<()> {
        if external.len() != self.external_len {
            return Err(BackendError::execution(format!(
                "expected {} external tensors, got {}",
                self.external_len,
                external.len()
            )));
        }
        for (position, step) in self.steps.iter().enumerate() {
            let (done, rest) = self.values.split_at_mut(position);
            let inputs: Vec<&TensorValue> = step
                .operands
                .iter()
                .map(|operand| match *operand {
                    Operand::External(slot) => external[slot],
                    Operand::Local(local) => &done[local],
                })
                .collect();
            let _scope = profiling::backend_scope(step.kind.label());
            execute(step, &inputs, &mut rest[0])?;
        }
        Ok(())
    }

    fn output(&self, op: OpId) -> Option<&TensorValue> {
        self.index.get(&op).map(|&position| &self.values[position])
    }

    fn update_params(&mut self, op: OpId, params: &[TensorValue]) -> BackendResult<()> {
        let position = *self
            .index
            .get(&op)
            .ok_or_else(|| BackendError::execution(format!("{op} is not part of this group")))?;
        let step = &mut self.steps[position];
        if step.params.len() != params.len() {
            return Err(BackendError::execution(format!(
                "{} holds {} parameter tensors, got {}",
                step.name,
                step.params.len(),
                params.len()
            )));
        }
        for (slot, incoming) in step.params.iter_mut().zip(params) {
            slot.copy_from(incoming)
                .map_err(|err| BackendError::execution(format!("{}: {err}", step.name)))?;
        }
        Ok(())
    }
}

macro_rules! with_element {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            DType::F32 => {
                type $T = f32;
                $body
            }
            DType::F64 => {
                type $T = f64;
                $body
            }
            DType::I8 => {
                type $T = i8;
                $body
            }
            DType::I16 => {
                type $T = i16;
                $body
            }
            DType::I32 => {
                type $T = i32;
                $body
            }
            DType::I64 => {
                type $T = i64;
                $body
            }
            DType::U8 => {
                type $T = u8;
                $body
            }
            DType::U16 => {
                type $T = u16;
                $body
            }
            DType::U32 => {
                type $T = u32;
                $body
            }
            DType::U64 => {
                type $T = u64;
                $body
            }
        }
    };
}

macro_rules! with_float {
    ($dtype:expr, $op:expr, $T:ident => $body:expr) => {
        match $dtype {
            DType::F32 => {
                type $T = f32;
                $body
            }
            DType::F64 => {
                type $T = f64;
                $body
            }
            other => Err(BackendError::unsupported(
                $op,
                format!("no reference kernel for {other} elements"),
            )),
        }
    };
}

fn typed<'a, T: Element>(value: &'a TensorValue, step: &Step) -> BackendResult<&'a Tensor<T>> {
    value.try_as_tensor::<T>().ok_or_else(|| {
        BackendError::execution(format!(
            "{} expected {} operands, found {}",
            step.name,
            T::DTYPE,
            value.dtype()
        ))
    })
}

fn all_typed<'a, T: Element>(
    values: &[&'a TensorValue],
    step: &Step,
) -> BackendResult<Vec<&'a Tensor<T>>> {
    values.iter().map(|value| typed::<T>(value, step)).collect()
}

fn optional_param<'a, T: Element>(
    step: &'a Step,
    slot: usize,
    present: bool,
) -> BackendResult<Option<&'a Tensor<T>>> {
    if present {
        typed::<T>(&step.params[slot], step).map(Some)
    } else {
        Ok(None)
    }
}

fn execute(step: &Step, inputs: &[&TensorValue], out: &mut TensorValue) -> BackendResult<()> {
    let label = step.kind.label();
    let mismatch = || {
        BackendError::execution(format!("{} output buffer is not {}", step.name, step.dtype))
    };
    match &step.kind {
        OpKind::Data(_) | OpKind::Flatten => with_element!(step.dtype, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::copy(typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Affine(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            let weight = typed::<T>(&step.params[0], step)?;
            let bias = optional_param::<T>(step, 1, spec.bias)?;
            kernels::affine(typed::<T>(inputs[0], step)?, weight, bias, out);
            Ok(())
        }),
        OpKind::Conv2d(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            let weight = typed::<T>(&step.params[0], step)?;
            let bias = optional_param::<T>(step, 1, spec.bias)?;
            kernels::conv2d(spec, typed::<T>(inputs[0], step)?, weight, bias, out);
            Ok(())
        }),
        OpKind::Pool2d(spec) if spec.kind == PoolKind::Max => with_element!(step.dtype, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::max_pool(spec, typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Pool2d(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::avg_pool(spec, typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Relu(spec) => with_element!(step.dtype, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::relu(spec.slope, typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Softmax => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::softmax(typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Lrn(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::lrn(spec, typed::<T>(inputs[0], step)?, out);
            Ok(())
        }),
        OpKind::Concat => with_element!(step.dtype, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::concat(&all_typed::<T>(inputs, step)?, out);
            Ok(())
        }),
        OpKind::Sum => with_element!(step.dtype, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            kernels::sum(&all_typed::<T>(inputs, step)?, out);
            Ok(())
        }),
        OpKind::BatchNorm(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            let mean = typed::<T>(&step.params[0], step)?;
            let variance = typed::<T>(&step.params[1], step)?;
            let scale_factor = typed::<T>(&step.params[2], step)?;
            let x = typed::<T>(inputs[0], step)?;
            kernels::batch_norm(spec, x, mean, variance, scale_factor, out);
            Ok(())
        }),
        OpKind::Scale(spec) => with_float!(step.dtype, label, T => {
            let out = out.try_as_tensor_mut::<T>().ok_or_else(mismatch)?;
            let gamma = typed::<T>(&step.params[0], step)?;
            let beta = optional_param::<T>(step, 1, spec.bias)?;
            kernels::scale(typed::<T>(inputs[0], step)?, gamma, beta, out);
            Ok(())
        }),
    }
}
