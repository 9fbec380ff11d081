//! Dense kernels over token-major activation buffers.
//!
//! Activations are plain `[f32]` slices holding `n` rows of `width` values.
//! Row-parallel kernels use rayon's current pool, so callers decide the
//! worker count by installing a pool around them. Every reduction runs
//! sequentially inside one row, which keeps results independent of the
//! number of workers.

use super::Tensor;
use crate::core::{NerError, Result};
use rayon::prelude::*;

const GELU_COEF_A: f32 = 0.044_715;
/// `sqrt(2 / pi)`
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Index of the largest value; the first one wins a tie.
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = i;
        }
    }
    best
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// Normalizes each row to zero mean and unit variance, then applies
/// `weight` and `bias`.
pub fn layer_norm(x: &mut [f32], width: usize, weight: &[f32], bias: &[f32], eps: f32) {
    if width == 0 {
        return;
    }
    x.par_chunks_mut(width).for_each(|row| {
        let n = width as f32;
        let mean = row.iter().sum::<f32>() / n;
        let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let scale = 1.0 / (var + eps).sqrt();
        for ((v, &w), &b) in row.iter_mut().zip(weight).zip(bias) {
            *v = (*v - mean) * scale * w + b;
        }
    });
}

pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh())
}

pub fn gelu_inplace(x: &mut [f32]) {
    x.par_iter_mut().for_each(|v| *v = gelu(*v));
}

/// Softmax of every row, shifted by the row maximum.
pub fn softmax_rows(x: &mut [f32], width: usize) {
    if width == 0 {
        return;
    }
    x.par_chunks_mut(width).for_each(softmax);
}

pub fn softmax(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// `out[t][o] = weight[o] . x[t] + bias[o]` for `n` input rows.
///
/// `weight` has `ne0` = input width and one row per output unit, in any
/// stored dtype. Each weight row is decoded once and applied to every input
/// row. `tmp` must hold `n * out_dim` values; it receives the output
/// unit-major before it is transposed into `out`.
pub fn linear(
    x: &[f32],
    n: usize,
    weight: &Tensor,
    bias: &[f32],
    tmp: &mut [f32],
    out: &mut [f32],
) -> Result<()> {
    let in_dim = weight.ne0();
    let out_dim = weight.rows();
    let needed = n * out_dim;
    if x.len() < n * in_dim {
        return Err(NerError::BufferTooSmall {
            needed: n * in_dim,
            got: x.len(),
        });
    }
    if tmp.len() < needed || out.len() < needed {
        return Err(NerError::BufferTooSmall {
            needed,
            got: tmp.len().min(out.len()),
        });
    }
    if bias.len() != out_dim {
        return Err(NerError::BufferTooSmall {
            needed: out_dim,
            got: bias.len(),
        });
    }
    if n == 0 || out_dim == 0 {
        return Ok(());
    }

    tmp[..needed]
        .par_chunks_mut(n)
        .enumerate()
        .try_for_each_init(
            || vec![0.0f32; in_dim],
            |row, (o, column)| -> Result<()> {
                weight.dequantize_row(o, row)?;
                for (t, dst) in column.iter_mut().enumerate() {
                    *dst = dot(row, &x[t * in_dim..(t + 1) * in_dim]) + bias[o];
                }
                Ok(())
            },
        )?;

    let tmp = &tmp[..needed];
    out[..needed]
        .par_chunks_mut(out_dim)
        .enumerate()
        .for_each(|(t, dst)| {
            for (o, v) in dst.iter_mut().enumerate() {
                *v = tmp[o * n + t];
            }
        });
    Ok(())
}
