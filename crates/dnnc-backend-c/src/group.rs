use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use dnnc::backend::{BackendError, BackendResult, CompiledGroup};
use dnnc::ops::OpId;
use dnnc::profiling;
use dnnc::tensor::TensorValue;

use crate::compile::CompiledModule;
use crate::ir::BufferDecl;

/// A group compiled into one native entry point.
///
/// Parameters and outputs live in backend-owned buffers whose addresses are handed to the module
/// on every call; caller tensors are bound positionally in plan external order.
pub struct CGroup {
    name: String,
    module: Arc<CompiledModule>,
    inputs: Vec<BufferDecl>,
    params: Vec<TensorValue>,
    param_slots: HashMap<OpId, Range<usize>>,
    outputs: Vec<TensorValue>,
    output_index: HashMap<OpId, usize>,
    compile_time: Option<Duration>,
}

impl CGroup {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        module: Arc<CompiledModule>,
        inputs: Vec<BufferDecl>,
        params: Vec<TensorValue>,
        param_slots: HashMap<OpId, Range<usize>>,
        outputs: Vec<TensorValue>,
        output_ops: &[OpId],
        compile_time: Option<Duration>,
    ) -> Self {
        let output_index = output_ops
            .iter()
            .enumerate()
            .map(|(slot, &op)| (op, slot))
            .collect();
        CGroup {
            name,
            module,
            inputs,
            params,
            param_slots,
            outputs,
            output_index,
            compile_time,
        }
    }

    /// Shared object backing this group.
    pub fn library_path(&self) -> &std::path::Path {
        self.module.path()
    }

    fn check_external(&self, external: &[&TensorValue]) -> BackendResult<()> {
        if external.len() != self.inputs.len() {
            return Err(BackendError::execution(format!(
                "{} expects {} external tensors, got {}",
                self.name,
                self.inputs.len(),
                external.len()
            )));
        }
        for (slot, (decl, value)) in self.inputs.iter().zip(external).enumerate() {
            if value.dtype() != decl.dtype || value.dims() != decl.dims.as_slice() {
                return Err(BackendError::execution(format!(
                    "{} external {slot} is {} {:?}, compiled for {} {:?}",
                    self.name,
                    value.dtype(),
                    value.dims(),
                    decl.dtype,
                    decl.dims
                )));
            }
        }
        Ok(())
    }
}

impl CompiledGroup for CGroup {
    fn run(&mut self, external: &[&TensorValue]) -> BackendResult<()> {
        self.check_external(external)?;
        let inputs: Vec<*const u8> = external
            .iter()
            .map(|value| value.as_bytes().as_ptr())
            .collect();
        let params: Vec<*const u8> = self
            .params
            .iter()
            .map(|value| value.as_bytes().as_ptr())
            .collect();
        let outputs: Vec<*mut u8> = self
            .outputs
            .iter_mut()
            .map(|value| value.as_bytes_mut().as_mut_ptr())
            .collect();

        let entry = self.module.entry();
        let status = {
            let _scope = profiling::backend_scope("c.entry");
            // SAFETY: every pointer addresses a live buffer whose dtype and extents match the
            // declarations the module was generated from; outputs are exclusively borrowed.
            unsafe { entry(inputs.as_ptr(), params.as_ptr(), outputs.as_ptr()) }
        };
        if status != 0 {
            return Err(BackendError::execution(format!(
                "{} entry point failed with status {status}",
                self.name
            )));
        }
        Ok(())
    }

    fn output(&self, op: OpId) -> Option<&TensorValue> {
        self.output_index.get(&op).map(|&slot| &self.outputs[slot])
    }

    fn update_params(&mut self, op: OpId, params: &[TensorValue]) -> BackendResult<()> {
        let Some(range) = self.param_slots.get(&op).cloned() else {
            // Ops without parameters own no slots; only an empty update is meaningful.
            if params.is_empty() {
                return Ok(());
            }
            return Err(BackendError::execution(format!(
                "{op} has no parameter slots in {}",
                self.name
            )));
        };
        if range.len() != params.len() {
            return Err(BackendError::execution(format!(
                "{op} holds {} parameter tensors, got {}",
                range.len(),
                params.len()
            )));
        }
        for (slot, incoming) in self.params[range].iter_mut().zip(params) {
            slot.copy_from(incoming)
                .map_err(|err| BackendError::execution(format!("{op}: {err}")))?;
        }
        Ok(())
    }

    fn compile_time(&self) -> Option<Duration> {
        self.compile_time
    }
}
