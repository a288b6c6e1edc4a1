//! Output shape and parameter-slot inference for every op kind.
//!
//! Inference runs once when an op is inserted into the graph. A failure is reported as a plain
//! message that the graph wraps with the op name.

use crate::tensor::{DType, Dims, MAX_RANK};

use super::kind::OpKind;

/// Shape and element type of one op input, as seen by inference.
#[derive(Debug, Clone, Copy)]
pub struct InputDesc<'a> {
    pub dims: &'a [usize],
    pub dtype: DType,
}

/// Result of shape inference: output extents, element type, and parameter slot extents.
#[derive(Debug, Clone, PartialEq)]
pub struct OpSignature {
    pub dims: Dims,
    pub dtype: DType,
    pub params: Vec<Vec<usize>>,
}

/// Padding applied on each side of a spatial axis for a window of `filter` taps.
pub fn same_padding(filter: usize) -> usize {
    filter.saturating_sub(1) / 2
}

/// `1 + (input + 2 * pad - filter) / stride`, with floor division.
pub fn conv_out_extent(input: usize, filter: usize, stride: usize) -> Option<usize> {
    let span = (input + 2 * same_padding(filter)).checked_sub(filter)?;
    Some(1 + span / stride)
}

/// `1 + ceil((input + 2 * pad - window) / stride)`.
///
/// Frameworks that clip the last window produce one fewer column for some sizes; this formula is
/// kept deliberately.
pub fn pool_out_extent(input: usize, window: usize, stride: usize) -> Option<usize> {
    let span = (input + 2 * same_padding(window)).checked_sub(window)?;
    Some(1 + span.div_ceil(stride))
}

pub fn infer(kind: &OpKind, inputs: &[InputDesc<'_>]) -> Result<OpSignature, String> {
    let dtype = match (kind, inputs.first()) {
        (OpKind::Data(spec), _) => spec.dtype,
        (_, Some(first)) => first.dtype,
        (_, None) => return Err(format!("{} requires at least one input", kind.label())),
    };
    if let Some(other) = inputs.iter().find(|input| input.dtype != dtype) {
        return Err(format!(
            "inputs mix element types {dtype} and {}",
            other.dtype
        ));
    }
    if kind.requires_float() && !dtype.is_float() {
        return Err(format!(
            "{} requires a floating-point element type, found {dtype}",
            kind.label()
        ));
    }

    let (dims, params): (Vec<usize>, Vec<Vec<usize>>) = match kind {
        OpKind::Data(spec) => {
            expect_arity(kind, inputs, 0)?;
            if spec.dims.is_empty() || spec.dims.len() > MAX_RANK {
                return Err(format!(
                    "data rank must be between 1 and {MAX_RANK}, got {}",
                    spec.dims.len()
                ));
            }
            if spec.dims.contains(&0) {
                return Err(format!("data extents {:?} contain a zero", spec.dims));
            }
            (spec.dims.clone(), Vec::new())
        }
        OpKind::Affine(spec) => {
            let input = single_input(kind, inputs, &[2])?;
            ensure_positive("units", spec.units)?;
            let (batch, features) = (input[0], input[1]);
            let mut params = vec![vec![spec.units, features]];
            if spec.bias {
                params.push(vec![spec.units]);
            }
            (vec![batch, spec.units], params)
        }
        OpKind::Conv2d(spec) => {
            let input = single_input(kind, inputs, &[4])?;
            ensure_positive("out_channels", spec.out_channels)?;
            ensure_window(spec.filter_h, spec.filter_w, spec.stride_h, spec.stride_w)?;
            let (batch, channels, height, width) = (input[0], input[1], input[2], input[3]);
            let out_h = conv_out_extent(height, spec.filter_h, spec.stride_h)
                .ok_or_else(|| window_too_large("filter", spec.filter_h, height))?;
            let out_w = conv_out_extent(width, spec.filter_w, spec.stride_w)
                .ok_or_else(|| window_too_large("filter", spec.filter_w, width))?;
            let mut params = vec![vec![
                spec.out_channels,
                channels,
                spec.filter_h,
                spec.filter_w,
            ]];
            if spec.bias {
                params.push(vec![spec.out_channels]);
            }
            (vec![batch, spec.out_channels, out_h, out_w], params)
        }
        OpKind::Pool2d(spec) => {
            let input = single_input(kind, inputs, &[4])?;
            ensure_window(spec.pool_h, spec.pool_w, spec.stride_h, spec.stride_w)?;
            let out_h = pool_out_extent(input[2], spec.pool_h, spec.stride_h)
                .ok_or_else(|| window_too_large("pool", spec.pool_h, input[2]))?;
            let out_w = pool_out_extent(input[3], spec.pool_w, spec.stride_w)
                .ok_or_else(|| window_too_large("pool", spec.pool_w, input[3]))?;
            (vec![input[0], input[1], out_h, out_w], Vec::new())
        }
        OpKind::Relu(_) => {
            let input = single_input(kind, inputs, &[1, 2, 3, 4])?;
            (input.to_vec(), Vec::new())
        }
        OpKind::Softmax => {
            let input = single_input(kind, inputs, &[2])?;
            (input.to_vec(), Vec::new())
        }
        OpKind::Lrn(spec) => {
            let input = single_input(kind, inputs, &[4])?;
            if spec.window == 0 || spec.window % 2 == 0 {
                return Err(format!("lrn window must be odd, got {}", spec.window));
            }
            (input.to_vec(), Vec::new())
        }
        OpKind::Concat => {
            let first = inputs[0].dims;
            let mut channels = 0;
            for input in inputs {
                if input.dims.len() != 4 {
                    return Err(format!(
                        "concat inputs must have rank 4, got {:?}",
                        input.dims
                    ));
                }
                if input.dims[0] != first[0] || input.dims[2..] != first[2..] {
                    return Err(format!(
                        "concat inputs {:?} and {:?} differ outside the channel axis",
                        first, input.dims
                    ));
                }
                channels += input.dims[1];
            }
            (vec![first[0], channels, first[2], first[3]], Vec::new())
        }
        OpKind::Flatten => {
            let input = single_input(kind, inputs, &[2, 3, 4])?;
            (vec![input[0], input[1..].iter().product()], Vec::new())
        }
        OpKind::Sum => {
            let first = inputs[0].dims;
            if first.is_empty() || first.len() > MAX_RANK {
                return Err(format!("sum input rank {} is not supported", first.len()));
            }
            if let Some(other) = inputs.iter().find(|input| input.dims != first) {
                return Err(format!(
                    "sum inputs {:?} and {:?} have different extents",
                    first, other.dims
                ));
            }
            (first.to_vec(), Vec::new())
        }
        OpKind::BatchNorm(_) => {
            let input = single_input(kind, inputs, &[2, 4])?;
            let channels = input[1];
            (
                input.to_vec(),
                vec![vec![channels], vec![channels], vec![1]],
            )
        }
        OpKind::Scale(spec) => {
            let input = single_input(kind, inputs, &[2, 4])?;
            let channels = input[1];
            let mut params = vec![vec![channels]];
            if spec.bias {
                params.push(vec![channels]);
            }
            (input.to_vec(), params)
        }
    };

    Ok(OpSignature {
        dims: Dims::from_vec(dims),
        dtype,
        params,
    })
}

fn expect_arity(kind: &OpKind, inputs: &[InputDesc<'_>], expected: usize) -> Result<(), String> {
    if inputs.len() != expected {
        return Err(format!(
            "{} expects {expected} input(s), got {}",
            kind.label(),
            inputs.len()
        ));
    }
    Ok(())
}

fn single_input<'a>(
    kind: &OpKind,
    inputs: &[InputDesc<'a>],
    ranks: &[usize],
) -> Result<&'a [usize], String> {
    expect_arity(kind, inputs, 1)?;
    let dims = inputs[0].dims;
    if !ranks.contains(&dims.len()) {
        return Err(format!(
            "{} expects an input of rank {ranks:?}, got {dims:?}",
            kind.label()
        ));
    }
    Ok(dims)
}

fn ensure_positive(what: &str, value: usize) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{what} must be positive"));
    }
    Ok(())
}

fn ensure_window(h: usize, w: usize, stride_h: usize, stride_w: usize) -> Result<(), String> {
    ensure_positive("window height", h)?;
    ensure_positive("window width", w)?;
    ensure_positive("stride height", stride_h)?;
    ensure_positive("stride width", stride_w)
}

fn window_too_large(what: &str, window: usize, extent: usize) -> String {
    format!("{what} of size {window} does not fit a padded extent of {extent}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_input(dims: &[usize]) -> InputDesc<'_> {
        InputDesc {
            dims,
            dtype: DType::F32,
        }
    }

    #[test]
    fn conv_same_padding_preserves_spatial_extent() {
        let sig = infer(&OpKind::conv2d(64, 3, 1), &[f32_input(&[16, 3, 224, 224])]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[16, 64, 224, 224]);
        assert_eq!(sig.params, vec![vec![64, 3, 3, 3], vec![64]]);
    }

    #[test]
    fn conv_stride_follows_floor_formula() {
        let sig = infer(&OpKind::conv2d(8, 3, 2), &[f32_input(&[1, 3, 15, 16])]).unwrap();
        // 1 + (15 + 2 - 3) / 2 = 8, 1 + (16 + 2 - 3) / 2 = 8
        assert_eq!(sig.dims.as_slice(), &[1, 8, 8, 8]);
        let sig = infer(&OpKind::conv2d(8, 7, 2), &[f32_input(&[1, 3, 224, 224])]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[1, 8, 112, 112]);
    }

    #[test]
    fn pool_uses_ceiling_division() {
        // 1 + ceil((5 - 2) / 2) = 3
        assert_eq!(pool_out_extent(5, 2, 2), Some(3));
        // 1 + ceil((112 + 2 - 3) / 2) = 57
        assert_eq!(pool_out_extent(112, 3, 2), Some(57));
        let sig = infer(&OpKind::max_pool(2, 2), &[f32_input(&[2, 4, 8, 8])]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[2, 4, 4, 4]);
    }

    #[test]
    fn affine_output_width_is_unit_count() {
        let sig = infer(&OpKind::affine(10), &[f32_input(&[4, 32])]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[4, 10]);
        assert_eq!(sig.params, vec![vec![10, 32], vec![10]]);
    }

    #[test]
    fn affine_rejects_rank_four_input() {
        let err = infer(&OpKind::affine(10), &[f32_input(&[1, 2, 3, 4])]).unwrap_err();
        assert!(err.contains("rank"), "{err}");
    }

    #[test]
    fn concat_sums_channels() {
        let a = [2, 3, 5, 5];
        let b = [2, 7, 5, 5];
        let sig = infer(&OpKind::Concat, &[f32_input(&a), f32_input(&b)]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[2, 10, 5, 5]);

        let c = [2, 7, 4, 5];
        assert!(infer(&OpKind::Concat, &[f32_input(&a), f32_input(&c)]).is_err());
    }

    #[test]
    fn flatten_collapses_trailing_axes() {
        let sig = infer(&OpKind::Flatten, &[f32_input(&[3, 4, 5, 6])]).unwrap();
        assert_eq!(sig.dims.as_slice(), &[3, 120]);
    }

    #[test]
    fn sum_requires_identical_extents_and_dtypes() {
        let a = [4, 4];
        let ok = infer(&OpKind::Sum, &[f32_input(&a), f32_input(&a), f32_input(&a)]).unwrap();
        assert_eq!(ok.dims.as_slice(), &a);
        assert!(infer(&OpKind::Sum, &[f32_input(&a), f32_input(&[4, 5])]).is_err());
        let int_input = InputDesc {
            dims: &a,
            dtype: DType::I32,
        };
        assert!(infer(&OpKind::Sum, &[f32_input(&a), int_input]).is_err());
    }

    #[test]
    fn float_only_kinds_reject_integers() {
        let input = InputDesc {
            dims: &[2, 8],
            dtype: DType::I32,
        };
        assert!(infer(&OpKind::Softmax, &[input]).is_err());
        assert!(infer(&OpKind::relu(), &[input]).is_ok());
    }

    #[test]
    fn lrn_requires_odd_window() {
        let dims = [1, 8, 4, 4];
        assert!(infer(&OpKind::lrn(5, 1e-4, 0.75), &[f32_input(&dims)]).is_ok());
        assert!(infer(&OpKind::lrn(4, 1e-4, 0.75), &[f32_input(&dims)]).is_err());
    }

    #[test]
    fn batch_norm_declares_three_parameter_slots() {
        let sig = infer(&OpKind::batch_norm(1e-5), &[f32_input(&[2, 6, 3, 3])]).unwrap();
        assert_eq!(sig.params, vec![vec![6], vec![6], vec![1]]);
    }

    #[test]
    fn data_rejects_rank_five() {
        let kind = OpKind::data(&[1, 2, 3, 4, 5], DType::F32);
        assert!(infer(&kind, &[]).is_err());
    }
}
