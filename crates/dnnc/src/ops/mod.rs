//! Operation nodes: the closed kind set, shape inference, and the arena that owns them.

mod kind;
mod node;
pub mod shape;

pub use kind::{
    AffineSpec, BatchNormSpec, Conv2dSpec, DataSpec, LrnSpec, OpKind, Pool2dSpec, PoolKind,
    ReluSpec, ScaleSpec,
};
pub use node::{OpArena, OpId, OpNode};
pub use shape::{InputDesc, OpSignature};
