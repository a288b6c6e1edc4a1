//! Runtime backend registry for strategy-based backend selection.
//!
//! Backend crates register a constructor for the strategy they implement. A [`Graph`] asks the
//! registry for a backend when a group's strategy has no explicitly attached instance.
//!
//! [`Graph`]: crate::graph::Graph

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::spec::{ExecutionBackend, ExecutionStrategy};

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn ExecutionBackend> + Send + Sync>;

struct BackendRegistry {
    backends: RwLock<HashMap<ExecutionStrategy, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, strategy: ExecutionStrategy, constructor: BackendConstructor) {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(strategy, constructor);
    }

    fn create(&self, strategy: ExecutionStrategy) -> Option<Arc<dyn ExecutionBackend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let constructor = registry.get(&strategy)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<ExecutionStrategy> {
        let mut strategies: Vec<_> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .keys()
            .copied()
            .collect();
        strategies.sort();
        strategies
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Registers the constructor used for `strategy`, replacing any earlier registration.
///
/// # Example
/// ```ignore
/// use dnnc::backend::registry::register_backend;
///
/// pub fn register() {
///     register_backend(ExecutionStrategy::Compiled, MyBackend::new);
/// }
/// ```
pub fn register_backend<B, F>(strategy: ExecutionStrategy, constructor: F)
where
    B: ExecutionBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    global_registry().register(
        strategy,
        Box::new(move || Arc::new(constructor()) as Arc<dyn ExecutionBackend>),
    );
}

/// Creates a backend instance for `strategy`, or `None` if nothing is registered for it.
pub fn create_backend(strategy: ExecutionStrategy) -> Option<Arc<dyn ExecutionBackend>> {
    global_registry().create(strategy)
}

pub fn has_backend(strategy: ExecutionStrategy) -> bool {
    global_registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .contains_key(&strategy)
}

/// Lists all strategies with a registered backend.
pub fn list_backends() -> Vec<ExecutionStrategy> {
    global_registry().list()
}
