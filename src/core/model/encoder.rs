//! Encoder forward pass: embeddings, self-attention blocks and the
//! token-classification head.
//!
//! Every intermediate lives in the caller's arena frame. Buffers are sized
//! for the actual sequence length and reused across blocks.

use super::{LayerWeights, Model, TokenId};
use crate::core::tensor::ops::{add_inplace, dot, gelu_inplace, layer_norm, linear, softmax};
use crate::core::tensor::Frame;
use crate::core::{NerError, Result};
use rayon::prelude::*;

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Working buffers for one forward pass.
struct Buffers<'a> {
    hidden: &'a mut [f32],
    q: &'a mut [f32],
    k: &'a mut [f32],
    v: &'a mut [f32],
    heads: &'a mut [f32],
    attn: &'a mut [f32],
    post_attn: &'a mut [f32],
    scores: &'a mut [f32],
    ff: &'a mut [f32],
    tmp: &'a mut [f32],
}

impl<'a> Buffers<'a> {
    fn alloc(frame: &mut Frame<'a>, model: &Model, n: usize) -> Result<Self> {
        let hp = model.hparams();
        let e = hp.n_embd;
        let widest = e.max(hp.n_intermediate).max(hp.n_labels);
        Ok(Self {
            hidden: frame.alloc(n * e)?,
            q: frame.alloc(n * e)?,
            k: frame.alloc(n * e)?,
            v: frame.alloc(n * e)?,
            heads: frame.alloc(n * e)?,
            attn: frame.alloc(n * e)?,
            post_attn: frame.alloc(n * e)?,
            scores: frame.alloc(hp.n_head * n * n)?,
            ff: frame.alloc(n * hp.n_intermediate)?,
            tmp: frame.alloc(n * widest)?,
        })
    }
}

/// Runs the encoder over `ids` and writes `ids.len() * n_labels` logits,
/// token-major, into `out`. Parallel kernels run on the current rayon pool.
pub fn forward(model: &Model, frame: &mut Frame<'_>, ids: &[TokenId], out: &mut [f32]) -> Result<()> {
    let hp = model.hparams();
    let n = ids.len();
    if n > hp.n_max_tokens {
        return Err(NerError::SequenceTooLong {
            len: n,
            max: hp.n_max_tokens,
        });
    }
    if let Some(&bad) = ids.iter().find(|&&id| id < 0 || id as usize >= hp.n_vocab) {
        return Err(NerError::InvalidToken(bad));
    }
    let needed = n * hp.n_labels;
    if out.len() < needed {
        return Err(NerError::BufferTooSmall {
            needed,
            got: out.len(),
        });
    }
    if n == 0 {
        return Ok(());
    }

    let mut buf = Buffers::alloc(frame, model, n)?;
    let w = model.weights();

    embed(model, ids, buf.hidden)?;
    layer_norm(buf.hidden, hp.n_embd, &w.norm_weight, &w.norm_bias, LAYER_NORM_EPS);

    for layer in &w.layers {
        block(model, layer, n, &mut buf)?;
    }

    linear(
        buf.hidden,
        n,
        &w.classifier_weight,
        &w.classifier_bias,
        buf.tmp,
        &mut out[..needed],
    )
}

/// Word row + token-type row 0 + position row, per token.
fn embed(model: &Model, ids: &[TokenId], hidden: &mut [f32]) -> Result<()> {
    let w = model.weights();
    let e = model.hparams().n_embd;

    let mut token_type = vec![0.0f32; e];
    w.token_type_embeddings.dequantize_row(0, &mut token_type)?;

    hidden
        .par_chunks_mut(e)
        .zip(ids.par_iter())
        .enumerate()
        .try_for_each_init(
            || vec![0.0f32; e],
            |position, (t, (row, &id))| -> Result<()> {
                w.word_embeddings.dequantize_row(id as usize, row)?;
                add_inplace(row, &token_type);
                w.position_embeddings.dequantize_row(t, position)?;
                add_inplace(row, position);
                Ok(())
            },
        )
}

fn block(model: &Model, layer: &LayerWeights, n: usize, buf: &mut Buffers<'_>) -> Result<()> {
    let hp = model.hparams();
    let e = hp.n_embd;

    linear(buf.hidden, n, &layer.q_w, &layer.q_b, buf.tmp, buf.q)?;
    linear(buf.hidden, n, &layer.k_w, &layer.k_b, buf.tmp, buf.k)?;
    linear(buf.hidden, n, &layer.v_w, &layer.v_b, buf.tmp, buf.v)?;

    attention(
        buf.q,
        buf.k,
        buf.v,
        n,
        hp.n_head,
        hp.head_dim(),
        buf.scores,
        buf.heads,
        buf.attn,
    );

    linear(buf.attn, n, &layer.o_w, &layer.o_b, buf.tmp, buf.post_attn)?;
    add_inplace(buf.post_attn, buf.hidden);
    layer_norm(buf.post_attn, e, &layer.ln_att_w, &layer.ln_att_b, LAYER_NORM_EPS);

    linear(buf.post_attn, n, &layer.ff_i_w, &layer.ff_i_b, buf.tmp, buf.ff)?;
    gelu_inplace(buf.ff);
    // the block input is no longer needed, so its buffer takes the output
    linear(buf.ff, n, &layer.ff_o_w, &layer.ff_o_b, buf.tmp, buf.hidden)?;
    add_inplace(buf.hidden, buf.post_attn);
    layer_norm(buf.hidden, e, &layer.ln_out_w, &layer.ln_out_b, LAYER_NORM_EPS);
    Ok(())
}

/// Scaled dot-product attention over `n_head` heads of width `d`.
///
/// `q`, `k`, `v` and `out` are token-major with head `h` in columns
/// `h*d..(h+1)*d`. `scores` holds one `n x n` matrix per head and `heads`
/// one `n x d` context matrix per head.
#[allow(clippy::too_many_arguments)]
fn attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    n: usize,
    n_head: usize,
    d: usize,
    scores: &mut [f32],
    heads: &mut [f32],
    out: &mut [f32],
) {
    let e = n_head * d;
    let scale = 1.0 / (d as f32).sqrt();

    scores[..n_head * n * n]
        .par_chunks_mut(n * n)
        .zip(heads[..n_head * n * d].par_chunks_mut(n * d))
        .enumerate()
        .for_each(|(h, (s, ctx))| {
            let col = h * d;
            for qi in 0..n {
                let query = &q[qi * e + col..qi * e + col + d];
                let row = &mut s[qi * n..(qi + 1) * n];
                for (ki, score) in row.iter_mut().enumerate() {
                    *score = dot(query, &k[ki * e + col..ki * e + col + d]) * scale;
                }
                softmax(row);

                let dst = &mut ctx[qi * d..(qi + 1) * d];
                dst.fill(0.0);
                for (ki, &p) in row.iter().enumerate() {
                    let value = &v[ki * e + col..ki * e + col + d];
                    for (c, &x) in dst.iter_mut().zip(value) {
                        *c += p * x;
                    }
                }
            }
        });

    for h in 0..n_head {
        for qi in 0..n {
            let src = &heads[h * n * d + qi * d..h * n * d + (qi + 1) * d];
            out[qi * e + h * d..qi * e + (h + 1) * d].copy_from_slice(src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{synthetic_model, HParamsBuilder, QuantKind};
    use crate::core::tensor::{ops, ScratchArena, Tensor};

    /// Logits for a sequence computed without an arena, for checking the
    /// pooled path. Reads weights through full dequantization.
    fn reference_forward(model: &Model, ids: &[TokenId]) -> Vec<f32> {
        let hp = model.hparams();
        let w = model.weights();
        let (n, e) = (ids.len(), hp.n_embd);

        let dense = |x: &[f32], t: &Tensor, b: &[f32]| -> Vec<f32> {
            let wm = t.to_f32_vec();
            let (i, o) = (t.ne0(), t.rows());
            let mut y = vec![0.0; n * o];
            for r in 0..n {
                for c in 0..o {
                    y[r * o + c] = dot(&wm[c * i..(c + 1) * i], &x[r * i..(r + 1) * i]) + b[c];
                }
            }
            y
        };

        let word = w.word_embeddings.to_f32_vec();
        let tt = w.token_type_embeddings.to_f32_vec();
        let pos = w.position_embeddings.to_f32_vec();
        let mut x = vec![0.0; n * e];
        for (t, &id) in ids.iter().enumerate() {
            for j in 0..e {
                x[t * e + j] = word[id as usize * e + j] + tt[j] + pos[t * e + j];
            }
        }
        layer_norm(&mut x, e, &w.norm_weight, &w.norm_bias, LAYER_NORM_EPS);

        for layer in &w.layers {
            let q = dense(&x, &layer.q_w, &layer.q_b);
            let k = dense(&x, &layer.k_w, &layer.k_b);
            let v = dense(&x, &layer.v_w, &layer.v_b);
            let mut scores = vec![0.0; hp.n_head * n * n];
            let mut heads = vec![0.0; n * e];
            let mut attn = vec![0.0; n * e];
            attention(&q, &k, &v, n, hp.n_head, hp.head_dim(), &mut scores, &mut heads, &mut attn);

            let mut post = dense(&attn, &layer.o_w, &layer.o_b);
            add_inplace(&mut post, &x);
            layer_norm(&mut post, e, &layer.ln_att_w, &layer.ln_att_b, LAYER_NORM_EPS);
            let mut ff = dense(&post, &layer.ff_i_w, &layer.ff_i_b);
            ff.iter_mut().for_each(|v| *v = ops::gelu(*v));
            x = dense(&ff, &layer.ff_o_w, &layer.ff_o_b);
            add_inplace(&mut x, &post);
            layer_norm(&mut x, e, &layer.ln_out_w, &layer.ln_out_b, LAYER_NORM_EPS);
        }
        dense(&x, &w.classifier_weight, &w.classifier_bias)
    }

    fn model(quant_kind: QuantKind) -> Model {
        let hp = HParamsBuilder::new()
            .n_vocab(6)
            .max_tokens(6)
            .embedding(32)
            .intermediate(64)
            .heads(4)
            .layers(2)
            .quant(quant_kind)
            .labels(9)
            .build()
            .unwrap();
        synthetic_model(hp, &["[CLS]", "[SEP]", "a", "b", "##c", "d"])
    }

    fn run(model: &Model, ids: &[TokenId], threads: usize) -> Result<Vec<f32>> {
        let hp = model.hparams();
        let mut arena = ScratchArena::with_capacity(crate::core::tensor::arena::scratch_elements(
            hp.n_max_tokens,
            hp.n_embd,
            hp.n_head,
            hp.n_intermediate,
            hp.n_labels,
        ).unwrap());
        let mut out = vec![0.0; ids.len() * hp.n_labels];
        let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
        pool.install(|| forward(model, &mut arena.frame(), ids, &mut out))?;
        Ok(out)
    }

    #[test]
    fn test_matches_reference() {
        for kind in [QuantKind::F32, QuantKind::F16, QuantKind::Q4_0] {
            let m = model(kind);
            let ids = [0, 2, 3, 4, 1];
            let got = run(&m, &ids, 2).unwrap();
            let want = reference_forward(&m, &ids);
            assert_eq!(got.len(), want.len());
            for (a, b) in got.iter().zip(&want) {
                assert!((a - b).abs() <= 1e-4 * b.abs().max(1.0), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_attention_by_hand() {
        // two tokens, two heads of width one, token-major [t0h0, t0h1, t1h0, t1h1]
        // head 0: zero queries give uniform weights over the keys
        // head 1: token 0 scores ln 3 against key 0 and 0 against key 1 -> [3/4, 1/4]
        let q = [0.0, 3f32.ln(), 0.0, 0.0];
        let k = [5.0, 1.0, -5.0, 0.0];
        let v = [2.0, 8.0, 4.0, 0.0];
        let mut scores = [0.0; 8];
        let mut heads = [0.0; 4];
        let mut out = [0.0; 4];
        attention(&q, &k, &v, 2, 2, 1, &mut scores, &mut heads, &mut out);

        let want = [3.0, 6.0, 3.0, 4.0];
        for (a, b) in out.iter().zip(&want) {
            assert!((a - b).abs() < 1e-5, "{:?} vs {:?}", out, want);
        }
        // head 1, query 0 attends over keys, not over queries
        assert!((scores[4] - 0.75).abs() < 1e-6 && (scores[5] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_attention_scales_by_head_width() {
        // one token, one head of width four: a lone key always gets weight 1,
        // so the output is the value row whatever the scores are
        let q = [1.0, 2.0, 3.0, 4.0];
        let k = [4.0, 3.0, 2.0, 1.0];
        let v = [0.5, -0.5, 1.5, -1.5];
        let mut scores = [0.0; 1];
        let mut heads = [0.0; 4];
        let mut out = [0.0; 4];
        attention(&q, &k, &v, 1, 1, 4, &mut scores, &mut heads, &mut out);
        assert_eq!(out, v);
        assert_eq!(scores[0], 1.0);

        // two tokens, one head of width four: raw scores 4 and 0 become 2 and 0
        // after dividing by sqrt(4), so query 0 weights the keys e^2 : 1
        let q = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let k = [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let v = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let mut scores = [0.0; 4];
        let mut heads = [0.0; 8];
        let mut out = [0.0; 8];
        attention(&q, &k, &v, 2, 1, 4, &mut scores, &mut heads, &mut out);
        let w0 = 2f32.exp() / (2f32.exp() + 1.0);
        assert!((out[0] - w0).abs() < 1e-6);
        assert!((out[1] - (1.0 - w0)).abs() < 1e-6);
        assert!((out[4] - 0.5).abs() < 1e-6 && (out[5] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_thread_count_does_not_change_logits() {
        let m = model(QuantKind::Q4_0);
        let ids = [0, 5, 4, 3, 2, 1];
        assert_eq!(run(&m, &ids, 1).unwrap(), run(&m, &ids, 4).unwrap());
    }

    #[test]
    fn test_rejects_bad_input() {
        let m = model(QuantKind::F32);
        assert!(matches!(run(&m, &[0, 9, 1], 1), Err(NerError::InvalidToken(9))));
        assert!(matches!(run(&m, &[0, -1], 1), Err(NerError::InvalidToken(-1))));
        assert!(matches!(
            run(&m, &[0; 7], 1),
            Err(NerError::SequenceTooLong { len: 7, max: 6 })
        ));
    }

    #[test]
    fn test_empty_sequence() {
        let m = model(QuantKind::F32);
        assert!(run(&m, &[], 1).unwrap().is_empty());
    }

    #[test]
    fn test_full_length_fits_arena() {
        let m = model(QuantKind::F16);
        let out = run(&m, &[0, 2, 3, 4, 5, 1], 3).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
