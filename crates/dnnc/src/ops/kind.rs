//! The closed set of operation kinds and their construction parameters.

use serde::{Deserialize, Serialize};

use crate::tensor::DType;

/// Externally supplied tensor with a fixed shape and element type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpec {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

/// Fully connected layer over a `[batch, inputs]` matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffineSpec {
    pub units: usize,
    pub bias: bool,
}

/// Same-padded 2D cross-correlation over an NCHW input.
///
/// Padding is `(filter - 1) / 2` on each side of each spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub out_channels: usize,
    pub filter_h: usize,
    pub filter_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub bias: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dSpec {
    pub pool_h: usize,
    pub pool_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub kind: PoolKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReluSpec {
    /// Multiplier applied to non-positive inputs; zero gives a plain ReLU.
    pub slope: f32,
}

/// Cross-channel local response normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrnSpec {
    /// Odd number of neighbouring channels summed around each channel.
    pub window: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

/// Inference-time batch normalization with stored running statistics.
///
/// The stored mean and variance are divided by a scale factor, the third parameter, before use.
/// A zero scale factor zeroes both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormSpec {
    pub epsilon: f32,
}

/// Per-channel affine transform `x * gamma + beta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSpec {
    pub bias: bool,
}

/// Operation kind tagged with its construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Data(DataSpec),
    Affine(AffineSpec),
    Conv2d(Conv2dSpec),
    Pool2d(Pool2dSpec),
    Relu(ReluSpec),
    Softmax,
    Lrn(LrnSpec),
    Concat,
    Flatten,
    Sum,
    BatchNorm(BatchNormSpec),
    Scale(ScaleSpec),
}

impl OpKind {
    pub fn data(dims: &[usize], dtype: DType) -> Self {
        OpKind::Data(DataSpec {
            dims: dims.to_vec(),
            dtype,
        })
    }

    pub fn affine(units: usize) -> Self {
        OpKind::Affine(AffineSpec { units, bias: true })
    }

    /// Square filter with the same stride on both spatial axes and a bias term.
    pub fn conv2d(out_channels: usize, filter: usize, stride: usize) -> Self {
        OpKind::Conv2d(Conv2dSpec {
            out_channels,
            filter_h: filter,
            filter_w: filter,
            stride_h: stride,
            stride_w: stride,
            bias: true,
        })
    }

    pub fn max_pool(window: usize, stride: usize) -> Self {
        Self::pool(window, stride, PoolKind::Max)
    }

    pub fn avg_pool(window: usize, stride: usize) -> Self {
        Self::pool(window, stride, PoolKind::Average)
    }

    fn pool(window: usize, stride: usize, kind: PoolKind) -> Self {
        OpKind::Pool2d(Pool2dSpec {
            pool_h: window,
            pool_w: window,
            stride_h: stride,
            stride_w: stride,
            kind,
        })
    }

    pub fn relu() -> Self {
        OpKind::Relu(ReluSpec { slope: 0.0 })
    }

    pub fn leaky_relu(slope: f32) -> Self {
        OpKind::Relu(ReluSpec { slope })
    }

    pub fn lrn(window: usize, alpha: f32, beta: f32) -> Self {
        OpKind::Lrn(LrnSpec {
            window,
            alpha,
            beta,
            k: 1.0,
        })
    }

    pub fn batch_norm(epsilon: f32) -> Self {
        OpKind::BatchNorm(BatchNormSpec { epsilon })
    }

    pub fn scale(bias: bool) -> Self {
        OpKind::Scale(ScaleSpec { bias })
    }

    /// Short lowercase label used in diagnostics and generated symbol names.
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Data(_) => "data",
            OpKind::Affine(_) => "affine",
            OpKind::Conv2d(_) => "conv2d",
            OpKind::Pool2d(_) => "pool2d",
            OpKind::Relu(_) => "relu",
            OpKind::Softmax => "softmax",
            OpKind::Lrn(_) => "lrn",
            OpKind::Concat => "concat",
            OpKind::Flatten => "flatten",
            OpKind::Sum => "sum",
            OpKind::BatchNorm(_) => "batch_norm",
            OpKind::Scale(_) => "scale",
        }
    }

    /// Kinds whose arithmetic is only defined for floating-point elements.
    pub fn requires_float(&self) -> bool {
        match self {
            OpKind::Affine(_)
            | OpKind::Conv2d(_)
            | OpKind::Softmax
            | OpKind::Lrn(_)
            | OpKind::BatchNorm(_)
            | OpKind::Scale(_) => true,
            OpKind::Pool2d(spec) => spec.kind == PoolKind::Average,
            OpKind::Data(_)
            | OpKind::Relu(_)
            | OpKind::Concat
            | OpKind::Flatten
            | OpKind::Sum => false,
        }
    }
}
