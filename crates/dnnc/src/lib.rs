extern crate self as dnnc;

pub mod backend;
pub mod env;
pub mod error;
pub mod graph;
pub mod io;
pub mod ops;
pub mod params;
pub mod profiling;
pub mod tensor;

pub use backend::{BackendError, BackendResult, ExecutionBackend, ExecutionStrategy, TargetArch};
pub use error::{GraphError, GraphResult};
pub use graph::{Graph, GroupId};
pub use ops::{OpId, OpKind, PoolKind};
pub use params::Params;
pub use tensor::{DType, Tensor, TensorValue};
