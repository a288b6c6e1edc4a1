use std::sync::Arc;

use dnnc::backend::{ExecutionBackend, ExecutionStrategy};
use dnnc_backend_c::CBackend;

dnnc_backend_tests::define_backend_tests!(c_backend, ExecutionStrategy::Compiled, || {
    Arc::new(CBackend::new()) as Arc<dyn ExecutionBackend>
});
