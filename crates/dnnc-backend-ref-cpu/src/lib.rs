pub mod cpu;
mod kernels;

pub use cpu::{RefCpuBackend, RefCpuGroup};

use dnnc::backend::registry::register_backend;
use dnnc::backend::ExecutionStrategy;

/// Registers [`RefCpuBackend`] for [`ExecutionStrategy::Reference`].
///
/// Runs automatically when the library is loaded on Linux; call it explicitly elsewhere.
pub fn register_ref_cpu_backend() {
    register_backend(ExecutionStrategy::Reference, RefCpuBackend::new);
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_cpu_backend();
    }
    register
};
