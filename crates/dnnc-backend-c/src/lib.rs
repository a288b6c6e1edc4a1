use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;

use dnnc::backend::registry::register_backend;
use dnnc::backend::{
    BackendResult, CompiledGroup, ExecutionBackend, ExecutionStrategy, GroupView,
};
use dnnc::profiling;
use dnnc::tensor::TensorValue;

mod codegen;
mod compile;
mod config;
mod dtype;
mod group;
pub mod ir;
mod lower;
mod schedule;

pub use codegen::ENTRY_SYMBOL;
pub use compile::{compiler_available, CompiledModule};
pub use config::{CCompileOptions, DEFAULT_CACHE_CAPACITY};
pub use group::CGroup;
pub use schedule::VECTORIZE_THRESHOLD;

/// Compiles each group into a native shared object through the system C compiler.
pub struct CBackend {
    options: CCompileOptions,
    modules: Mutex<LruCache<[u8; 32], Arc<CompiledModule>>>,
}

impl CBackend {
    /// Backend configured from `CC` and the `DNNC_C_*` environment variables.
    pub fn new() -> Self {
        Self::with_options(CCompileOptions::from_env())
    }

    pub fn with_options(options: CCompileOptions) -> Self {
        let capacity =
            NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        CBackend {
            options,
            modules: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn options(&self) -> &CCompileOptions {
        &self.options
    }

    fn get_or_compile(&self, source: &str) -> BackendResult<Arc<CompiledModule>> {
        let key = compile::cache_key(source, &self.options);
        if let Some(found) = self
            .modules
            .lock()
            .expect("compiled module cache poisoned")
            .get(&key)
            .cloned()
        {
            profiling::cache_event("c.module_hit");
            log::debug!("module cache hit {}", compile::hex(&key));
            return Ok(found);
        }
        profiling::cache_event("c.module_miss");

        let module = Arc::new(compile::build_module(source, &key, &self.options)?);
        self.modules
            .lock()
            .expect("compiled module cache poisoned")
            .put(key, Arc::clone(&module));
        Ok(module)
    }
}

impl Default for CBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for CBackend {
    fn backend_name(&self) -> &str {
        "c"
    }

    fn build_group(&self, group: &GroupView<'_>) -> BackendResult<Box<dyn CompiledGroup>> {
        let started = Instant::now();
        let mut lowered = lower::lower_group(group)?;
        schedule::schedule_program(&mut lowered.program, group.target)?;
        let source = codegen::emit_program(&lowered.program, group.name)?;
        let module = self.get_or_compile(&source)?;

        let params = lowered
            .param_slots
            .iter()
            .flat_map(|(op, _)| group.node(*op).params().iter().cloned())
            .collect::<Vec<_>>();
        let param_slots: HashMap<_, _> = lowered.param_slots.into_iter().collect();
        let outputs = lowered
            .outputs
            .iter()
            .map(|&op| {
                let node = group.node(op);
                TensorValue::zeros(node.dtype(), node.dims())
            })
            .collect();

        let elapsed = started.elapsed();
        log::info!(
            "c backend built {} ({} funcs) in {:.1} ms",
            group.name,
            lowered.program.funcs.len(),
            elapsed.as_secs_f64() * 1e3
        );
        Ok(Box::new(CGroup::new(
            group.name.to_string(),
            module,
            lowered.program.inputs,
            params,
            param_slots,
            outputs,
            &lowered.outputs,
            Some(elapsed),
        )))
    }
}

/// Generated C for `group`, exactly as [`CBackend`] would compile it.
pub fn emit_group_source(group: &GroupView<'_>) -> BackendResult<String> {
    let mut lowered = lower::lower_group(group)?;
    schedule::schedule_program(&mut lowered.program, group.target)?;
    codegen::emit_program(&lowered.program, group.name)
}

/// Registers [`CBackend`] for [`ExecutionStrategy::Compiled`].
///
/// Runs automatically when the library is loaded on Linux; call it explicitly elsewhere.
pub fn register_c_backend() {
    register_backend(ExecutionStrategy::Compiled, CBackend::new);
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_C_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_c_backend();
    }
    register
};
