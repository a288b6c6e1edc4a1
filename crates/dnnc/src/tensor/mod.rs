//! Host tensor container shared by the graph, its ops, and every backend.
//!
//! Tensors own a flat row-major allocation with at most four dimensions. [`TensorValue`] erases
//! the element type so inputs, outputs, and parameters of different dtypes can live in one map.

pub mod dtype;
pub mod element;
mod host;
mod value;

use smallvec::SmallVec;
use thiserror::Error;

pub use dtype::DType;
pub use element::{Element, FloatElement};
pub use host::{element_count, row_major_strides, Tensor};
pub use value::TensorValue;

/// Largest rank a tensor or op output may have.
pub const MAX_RANK: usize = 4;

/// Inline storage for extents and strides.
pub type Dims = SmallVec<[usize; MAX_RANK]>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("tensor extents {lhs:?} and {rhs:?} differ")]
    ExtentMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("tensor data length {actual} does not match extents {dims:?} ({expected} elements)")]
    LengthMismatch {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("tensor rank {rank} exceeds the supported maximum of 4")]
    RankTooLarge { rank: usize },
    #[error("expected {expected} tensor, found {found}")]
    DTypeMismatch { expected: DType, found: DType },
}
