//! Direct per-op kernels over host tensors.
//!
//! Every kernel writes a preallocated output whose extents were fixed by shape inference, so the
//! loops below index without re-validating shapes.

use dnnc::ops::shape::same_padding;
use dnnc::ops::{BatchNormSpec, Conv2dSpec, LrnSpec, Pool2dSpec};
use dnnc::tensor::{Element, FloatElement, Tensor};

pub fn copy<T: Element>(input: &Tensor<T>, out: &mut Tensor<T>) {
    out.data_mut().copy_from_slice(input.data());
}

/// `out[n, u] = b[u] + sum_k x[n, k] * w[u, k]`.
pub fn affine<T: FloatElement>(
    x: &Tensor<T>,
    weight: &Tensor<T>,
    bias: Option<&Tensor<T>>,
    out: &mut Tensor<T>,
) {
    let (batch, inner) = (x.dims()[0], x.dims()[1]);
    let units = weight.dims()[0];
    let (xs, ws) = (x.data(), weight.data());
    let os = out.data_mut();
    for n in 0..batch {
        let row = &xs[n * inner..(n + 1) * inner];
        for u in 0..units {
            let w_row = &ws[u * inner..(u + 1) * inner];
            let mut acc = T::zero();
            for (a, b) in row.iter().zip(w_row) {
                acc = acc + *a * *b;
            }
            if let Some(bias) = bias {
                acc = acc + bias.data()[u];
            }
            os[n * units + u] = acc;
        }
    }
}

/// Returns the input element or zero outside the image.
#[inline]
fn tap<T: Element>(
    data: &[T],
    base: usize,
    width: usize,
    height: usize,
    y: isize,
    x: isize,
) -> T {
    if y < 0 || x < 0 || y as usize >= height || x as usize >= width {
        T::zero()
    } else {
        data[base + y as usize * width + x as usize]
    }
}

pub fn conv2d<T: FloatElement>(
    spec: &Conv2dSpec,
    x: &Tensor<T>,
    weight: &Tensor<T>,
    bias: Option<&Tensor<T>>,
    out: &mut Tensor<T>,
) {
    let [batch, channels, in_h, in_w] = [x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]];
    let [_, filters, out_h, out_w] = [
        out.dims()[0],
        out.dims()[1],
        out.dims()[2],
        out.dims()[3],
    ];
    let pad_h = same_padding(spec.filter_h) as isize;
    let pad_w = same_padding(spec.filter_w) as isize;
    let (fh, fw) = (spec.filter_h, spec.filter_w);
    let (xs, ws) = (x.data(), weight.data());
    let os = out.data_mut();

    for n in 0..batch {
        for f in 0..filters {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = T::zero();
                    for c in 0..channels {
                        let base = (n * channels + c) * in_h * in_w;
                        let w_base = (f * channels + c) * fh * fw;
                        for ky in 0..fh {
                            let iy = (oy * spec.stride_h + ky) as isize - pad_h;
                            for kx in 0..fw {
                                let ix = (ox * spec.stride_w + kx) as isize - pad_w;
                                let v = tap(xs, base, in_w, in_h, iy, ix);
                                acc = acc + v * ws[w_base + ky * fw + kx];
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        acc = acc + bias.data()[f];
                    }
                    os[((n * filters + f) * out_h + oy) * out_w + ox] = acc;
                }
            }
        }
    }
}

/// Visits every window of a pooling op, handing the taps (zero outside the image) to `reduce`.
fn pool_windows<T: Element>(
    spec: &Pool2dSpec,
    x: &Tensor<T>,
    out: &mut Tensor<T>,
    mut reduce: impl FnMut(&mut dyn Iterator<Item = T>) -> T,
) {
    let [batch, channels, in_h, in_w] = [x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]];
    let (out_h, out_w) = (out.dims()[2], out.dims()[3]);
    let pad_h = same_padding(spec.pool_h) as isize;
    let pad_w = same_padding(spec.pool_w) as isize;
    let xs = x.data();
    let os = out.data_mut();

    for plane in 0..batch * channels {
        let base = plane * in_h * in_w;
        for oy in 0..out_h {
            for ox in 0..out_w {
                let y0 = (oy * spec.stride_h) as isize - pad_h;
                let x0 = (ox * spec.stride_w) as isize - pad_w;
                let mut taps = (0..spec.pool_h).flat_map(move |ky| {
                    (0..spec.pool_w)
                        .map(move |kx| tap(xs, base, in_w, in_h, y0 + ky as isize, x0 + kx as isize))
                });
                os[(plane * out_h + oy) * out_w + ox] = reduce(&mut taps);
            }
        }
    }
}

pub fn max_pool<T: Element>(spec: &Pool2dSpec, x: &Tensor<T>, out: &mut Tensor<T>) {
    pool_windows(spec, x, out, |taps| {
        taps.fold(T::lowest(), |acc, v| if v > acc { v } else { acc })
    });
}

/// Window sum divided by the full window area, padding included.
pub fn avg_pool<T: FloatElement>(spec: &Pool2dSpec, x: &Tensor<T>, out: &mut Tensor<T>) {
    let area = T::from_f64((spec.pool_h * spec.pool_w) as f64);
    pool_windows(spec, x, out, |taps| {
        taps.fold(T::zero(), |acc, v| acc + v) / area
    });
}

pub fn relu<T: Element>(slope: f32, x: &Tensor<T>, out: &mut Tensor<T>) {
    for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
        *o = if v > T::zero() { v } else { v.scale(slope) };
    }
}

/// Row-wise softmax over dim 1 of a `[batch, classes]` matrix.
pub fn softmax<T: FloatElement>(x: &Tensor<T>, out: &mut Tensor<T>) {
    let classes = x.dims()[1];
    if classes == 0 {
        return;
    }
    for (row, out_row) in x
        .data()
        .chunks_exact(classes)
        .zip(out.data_mut().chunks_exact_mut(classes))
    {
        let max = row
            .iter()
            .copied()
            .fold(T::lowest(), |acc, v| if v > acc { v } else { acc });
        let mut total = T::zero();
        for (o, &v) in out_row.iter_mut().zip(row) {
            *o = (v - max).exp();
            total = total + *o;
        }
        for o in out_row.iter_mut() {
            *o = *o / total;
        }
    }
}

pub fn lrn<T: FloatElement>(spec: &LrnSpec, x: &Tensor<T>, out: &mut Tensor<T>) {
    let [batch, channels, height, width] =
        [x.dims()[0], x.dims()[1], x.dims()[2], x.dims()[3]];
    let plane = height * width;
    let half = spec.window / 2;
    let k = T::from_f32(spec.k);
    let alpha = T::from_f32(spec.alpha / spec.window as f32);
    let beta = T::from_f32(spec.beta);
    let xs = x.data();
    let os = out.data_mut();

    for n in 0..batch {
        for c in 0..channels {
            let lo = c.saturating_sub(half);
            let hi = (c + half).min(channels - 1);
            for p in 0..plane {
                let mut sq = T::zero();
                for nc in lo..=hi {
                    let v = xs[(n * channels + nc) * plane + p];
                    sq = sq + v * v;
                }
                let idx = (n * channels + c) * plane + p;
                os[idx] = xs[idx] / (k + alpha * sq).powf(beta);
            }
        }
    }
}

/// Concatenates NCHW inputs along the channel axis.
pub fn concat<T: Element>(inputs: &[&Tensor<T>], out: &mut Tensor<T>) {
    let batch = out.dims()[0];
    let plane = out.dims()[2] * out.dims()[3];
    let os = out.data_mut();
    let mut cursor = 0;
    for n in 0..batch {
        for input in inputs {
            let chunk = input.dims()[1] * plane;
            os[cursor..cursor + chunk].copy_from_slice(&input.data()[n * chunk..(n + 1) * chunk]);
            cursor += chunk;
        }
    }
}

pub fn sum<T: Element>(inputs: &[&Tensor<T>], out: &mut Tensor<T>) {
    let Some((first, rest)) = inputs.split_first() else {
        return;
    };
    let os = out.data_mut();
    os.copy_from_slice(first.data());
    for input in rest {
        for (o, &v) in os.iter_mut().zip(input.data()) {
            *o = o.accumulate(v);
        }
    }
}

/// Number of elements that share one channel index within a single batch row.
fn channel_stride<T: Element>(x: &Tensor<T>) -> usize {
    x.dims()[2..].iter().product()
}

pub fn batch_norm<T: FloatElement>(
    spec: &BatchNormSpec,
    x: &Tensor<T>,
    mean: &Tensor<T>,
    variance: &Tensor<T>,
    scale_factor: &Tensor<T>,
    out: &mut Tensor<T>,
) {
    let channels = x.dims()[1];
    let inner = channel_stride(x);
    let sf = scale_factor.data()[0];
    let inv = if sf == T::zero() { T::zero() } else { T::one() / sf };
    let eps = T::from_f32(spec.epsilon);

    for (i, (o, &v)) in out.data_mut().iter_mut().zip(x.data()).enumerate() {
        let c = (i / inner) % channels;
        let m = mean.data()[c] * inv;
        let var = variance.data()[c] * inv;
        *o = (v - m) / (var + eps).sqrt();
    }
}

pub fn scale<T: FloatElement>(
    x: &Tensor<T>,
    gamma: &Tensor<T>,
    beta: Option<&Tensor<T>>,
    out: &mut Tensor<T>,
) {
    let channels = x.dims()[1];
    let inner = channel_stride(x);
    for (i, (o, &v)) in out.data_mut().iter_mut().zip(x.data()).enumerate() {
        let c = (i / inner) % channels;
        let mut y = v * gamma.data()[c];
        if let Some(beta) = beta {
            y = y + beta.data()[c];
        }
        *o = y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnnc::ops::OpKind;

    fn t(dims: &[usize], data: Vec<f32>) -> Tensor<f32> {
        Tensor::from_vec(dims, data).unwrap()
    }

    #[test]
    fn conv_identity_filter_preserves_input() {
        let spec = match OpKind::conv2d(1, 3, 1) {
            OpKind::Conv2d(spec) => spec,
            _ => unreachable!(),
        };
        let x = t(&[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect());
        let mut w = vec![0.0f32; 9];
        w[4] = 1.0;
        let w = t(&[1, 1, 3, 3], w);
        let b = t(&[1], vec![0.5]);
        let mut out = Tensor::new(&[1, 1, 3, 3]);
        conv2d(&spec, &x, &w, Some(&b), &mut out);
        let expected: Vec<f32> = (1..=9).map(|v| v as f32 + 0.5).collect();
        assert_eq!(out.data(), expected.as_slice());
    }

    #[test]
    fn conv_box_filter_sees_zero_border() {
        let spec = match OpKind::conv2d(1, 3, 1) {
            OpKind::Conv2d(spec) => spec,
            _ => unreachable!(),
        };
        let x = Tensor::full(&[1, 1, 3, 3], 1.0f32);
        let w = Tensor::full(&[1, 1, 3, 3], 1.0f32);
        let mut out = Tensor::new(&[1, 1, 3, 3]);
        conv2d(&spec, &x, &w, None, &mut out);
        assert_eq!(out.data(), &[4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn max_pool_counts_zero_padding() {
        let spec = match OpKind::max_pool(3, 1) {
            OpKind::Pool2d(spec) => spec,
            _ => unreachable!(),
        };
        let x = Tensor::full(&[1, 1, 2, 2], -1.0f32);
        let mut out = Tensor::new(&[1, 1, 2, 2]);
        max_pool(&spec, &x, &mut out);
        assert!(out.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn avg_pool_divides_by_full_window() {
        let spec = match OpKind::avg_pool(2, 2) {
            OpKind::Pool2d(spec) => spec,
            _ => unreachable!(),
        };
        let x = t(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut out = Tensor::new(&[1, 1, 1, 1]);
        avg_pool(&spec, &x, &mut out);
        assert_eq!(out.data(), &[2.5]);
    }

    #[test]
    fn softmax_rows_are_normalized() {
        let x = t(&[2, 3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]);
        let mut out = Tensor::new(&[2, 3]);
        softmax(&x, &mut out);
        let first: f32 = out.data()[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-6);
        assert!(out.data()[3..].iter().all(|&v| (v - 1.0 / 3.0).abs() < 1e-6));
        assert!(out.data()[2] > out.data()[1]);
    }

    #[test]
    fn leaky_relu_scales_negatives() {
        let x = t(&[4], vec![-2.0, -0.0, 0.5, 3.0]);
        let mut out = Tensor::new(&[4]);
        relu(0.1, &x, &mut out);
        assert_eq!(out.data(), &[-0.2, 0.0, 0.5, 3.0]);
    }

    #[test]
    fn lrn_single_channel_matches_closed_form() {
        let spec = LrnSpec {
            window: 3,
            alpha: 3.0,
            beta: 0.5,
            k: 1.0,
        };
        let x = t(&[1, 1, 1, 2], vec![1.0, 2.0]);
        let mut out = Tensor::new(&[1, 1, 1, 2]);
        lrn(&spec, &x, &mut out);
        assert!((out.data()[0] - 1.0 / 2.0f32.sqrt()).abs() < 1e-6);
        assert!((out.data()[1] - 2.0 / 5.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn concat_interleaves_per_batch() {
        let a = t(&[2, 1, 1, 1], vec![1.0, 2.0]);
        let b = t(&[2, 2, 1, 1], vec![10.0, 11.0, 20.0, 21.0]);
        let mut out = Tensor::new(&[2, 3, 1, 1]);
        concat(&[&a, &b], &mut out);
        assert_eq!(out.data(), &[1.0, 10.0, 11.0, 2.0, 20.0, 21.0]);
    }

    #[test]
    fn batch_norm_zero_scale_factor_zeroes_statistics() {
        let spec = BatchNormSpec { epsilon: 0.0 };
        let x = t(&[1, 2], vec![4.0, 9.0]);
        let mean = t(&[2], vec![100.0, 100.0]);
        let var = t(&[2], vec![100.0, 100.0]);
        let mut out = Tensor::new(&[1, 2]);

        batch_norm(&spec, &x, &mean, &var, &t(&[1], vec![0.0]), &mut out);
        assert!(out.data().iter().all(|v| v.is_infinite()));

        let var = t(&[2], vec![4.0, 16.0]);
        let mean = t(&[2], vec![2.0, 6.0]);
        batch_norm(&spec, &x, &mean, &var, &t(&[1], vec![2.0]), &mut out);
        assert_eq!(out.data(), &[(4.0 - 1.0) / 2.0f32.sqrt(), (9.0 - 3.0) / 8.0f32.sqrt()]);
    }

    #[test]
    fn scale_applies_per_channel() {
        let x = t(&[1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let gamma = t(&[2], vec![2.0, -1.0]);
        let beta = t(&[2], vec![0.5, 0.0]);
        let mut out = Tensor::new(&[1, 2, 1, 2]);
        scale(&x, &gamma, Some(&beta), &mut out);
        assert_eq!(out.data(), &[2.5, 4.5, -3.0, -4.0]);
    }
}
