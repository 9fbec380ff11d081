//! Canonical tensor names and the table the loader fills by name.

use super::config::HParams;
use super::{LayerWeights, Weights};
use crate::core::tensor::{DType, Shape, Tensor};
use crate::core::{NerError, Result};
use std::collections::HashMap;

pub const WORD_EMBEDDINGS: &str = "embeddings.word_embeddings.weight";
pub const TOKEN_TYPE_EMBEDDINGS: &str = "embeddings.token_type_embeddings.weight";
pub const POSITION_EMBEDDINGS: &str = "embeddings.position_embeddings.weight";
pub const EMBEDDINGS_NORM_WEIGHT: &str = "embeddings.LayerNorm.weight";
pub const EMBEDDINGS_NORM_BIAS: &str = "embeddings.LayerNorm.bias";
pub const CLASSIFIER_WEIGHT: &str = "classifier.weight";
pub const CLASSIFIER_BIAS: &str = "classifier.bias";

/// Number of token-type rows stored in the embedding table.
pub const TOKEN_TYPES: usize = 2;

/// Per-layer tensor suffixes, in the order they are allocated.
pub const LAYER_TENSORS: [&str; 16] = [
    "attention.self.query.weight",
    "attention.self.query.bias",
    "attention.self.key.weight",
    "attention.self.key.bias",
    "attention.self.value.weight",
    "attention.self.value.bias",
    "attention.output.dense.weight",
    "attention.output.dense.bias",
    "attention.output.LayerNorm.weight",
    "attention.output.LayerNorm.bias",
    "intermediate.dense.weight",
    "intermediate.dense.bias",
    "output.dense.weight",
    "output.dense.bias",
    "output.LayerNorm.weight",
    "output.LayerNorm.bias",
];

pub fn layer_tensor(layer: usize, suffix: &str) -> String {
    format!("encoder.layer.{}.{}", layer, suffix)
}

struct Entry {
    name: String,
    tensor: Tensor,
    populated: bool,
}

/// Every tensor a model declares, allocated zeroed and addressable by name.
pub struct TensorRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Allocates the full tensor set implied by `hparams`.
    pub fn for_hparams(hparams: &HParams) -> Self {
        let wtype = hparams.quant.weight_dtype();
        let e = hparams.n_embd;
        let i = hparams.n_intermediate;

        let mut registry = Self::new();
        registry.declare(WORD_EMBEDDINGS, wtype, &[e, hparams.n_vocab]);
        registry.declare(TOKEN_TYPE_EMBEDDINGS, wtype, &[e, TOKEN_TYPES]);
        registry.declare(POSITION_EMBEDDINGS, wtype, &[e, hparams.n_max_tokens]);
        registry.declare(EMBEDDINGS_NORM_WEIGHT, DType::F32, &[e]);
        registry.declare(EMBEDDINGS_NORM_BIAS, DType::F32, &[e]);

        for layer in 0..hparams.n_layer {
            for suffix in LAYER_TENSORS {
                let (dtype, dims): (DType, Vec<usize>) = match suffix {
                    "intermediate.dense.weight" => (wtype, vec![e, i]),
                    "intermediate.dense.bias" => (DType::F32, vec![i]),
                    "output.dense.weight" => (wtype, vec![i, e]),
                    s if s.ends_with(".weight") && !s.contains("LayerNorm") => (wtype, vec![e, e]),
                    _ => (DType::F32, vec![e]),
                };
                registry.declare(&layer_tensor(layer, suffix), dtype, &dims);
            }
        }

        registry.declare(CLASSIFIER_WEIGHT, wtype, &[e, hparams.n_labels]);
        registry.declare(CLASSIFIER_BIAS, DType::F32, &[hparams.n_labels]);
        registry
    }

    pub fn declare(&mut self, name: &str, dtype: DType, dims: &[usize]) {
        let entry = Entry {
            name: name.to_string(),
            tensor: Tensor::zeros(dtype, Shape::from_slice(dims)),
            populated: false,
        };
        match self.index.get(name) {
            Some(&idx) => self.entries[idx] = entry,
            None => {
                self.index.insert(name.to_string(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&idx| &self.entries[idx].tensor)
    }

    /// Storage for `name`, marking it as populated.
    pub fn fill(&mut self, name: &str) -> Option<&mut Tensor> {
        let idx = *self.index.get(name)?;
        let entry = &mut self.entries[idx];
        entry.populated = true;
        Some(&mut entry.tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn populated(&self) -> usize {
        self.entries.iter().filter(|e| e.populated).count()
    }

    pub fn unpopulated(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| !e.populated)
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    fn take(&mut self, name: &str) -> Result<Tensor> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| NerError::format(format!("tensor '{}' was never declared", name)))?;
        Ok(std::mem::replace(
            &mut self.entries[idx].tensor,
            Tensor::zeros(DType::F32, Shape::new(vec![0])),
        ))
    }

    fn take_f32(&mut self, name: &str) -> Result<Vec<f32>> {
        Ok(self.take(name)?.to_f32_vec())
    }

    /// Moves the tensors into the typed layout the encoder reads.
    pub fn into_weights(mut self, hparams: &HParams) -> Result<Weights> {
        let word_embeddings = self.take(WORD_EMBEDDINGS)?;
        let token_type_embeddings = self.take(TOKEN_TYPE_EMBEDDINGS)?;
        let position_embeddings = self.take(POSITION_EMBEDDINGS)?;
        let norm_weight = self.take_f32(EMBEDDINGS_NORM_WEIGHT)?;
        let norm_bias = self.take_f32(EMBEDDINGS_NORM_BIAS)?;

        let mut layers = Vec::with_capacity(hparams.n_layer);
        for layer in 0..hparams.n_layer {
            let name = |suffix: &str| layer_tensor(layer, suffix);
            layers.push(LayerWeights {
                q_w: self.take(&name("attention.self.query.weight"))?,
                q_b: self.take_f32(&name("attention.self.query.bias"))?,
                k_w: self.take(&name("attention.self.key.weight"))?,
                k_b: self.take_f32(&name("attention.self.key.bias"))?,
                v_w: self.take(&name("attention.self.value.weight"))?,
                v_b: self.take_f32(&name("attention.self.value.bias"))?,
                o_w: self.take(&name("attention.output.dense.weight"))?,
                o_b: self.take_f32(&name("attention.output.dense.bias"))?,
                ln_att_w: self.take_f32(&name("attention.output.LayerNorm.weight"))?,
                ln_att_b: self.take_f32(&name("attention.output.LayerNorm.bias"))?,
                ff_i_w: self.take(&name("intermediate.dense.weight"))?,
                ff_i_b: self.take_f32(&name("intermediate.dense.bias"))?,
                ff_o_w: self.take(&name("output.dense.weight"))?,
                ff_o_b: self.take_f32(&name("output.dense.bias"))?,
                ln_out_w: self.take_f32(&name("output.LayerNorm.weight"))?,
                ln_out_b: self.take_f32(&name("output.LayerNorm.bias"))?,
            });
        }

        Ok(Weights {
            word_embeddings,
            token_type_embeddings,
            position_embeddings,
            norm_weight,
            norm_bias,
            layers,
            classifier_weight: self.take(CLASSIFIER_WEIGHT)?,
            classifier_bias: self.take_f32(CLASSIFIER_BIAS)?,
        })
    }
}

impl Default for TensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
