pub mod config;
pub mod encoder;
pub mod registry;

pub use config::{HParams, HParamsBuilder, QuantKind};
pub use registry::TensorRegistry;

use crate::core::tensor::Tensor;
use crate::core::tokenizer::Vocabulary;

/// Token id as stored in the model vocabulary.
pub type TokenId = i32;

/// Weights of one encoder block. Matrices keep their stored encoding;
/// biases and layer-norm parameters are held as f32.
pub struct LayerWeights {
    pub q_w: Tensor,
    pub q_b: Vec<f32>,
    pub k_w: Tensor,
    pub k_b: Vec<f32>,
    pub v_w: Tensor,
    pub v_b: Vec<f32>,
    pub o_w: Tensor,
    pub o_b: Vec<f32>,
    pub ln_att_w: Vec<f32>,
    pub ln_att_b: Vec<f32>,
    pub ff_i_w: Tensor,
    pub ff_i_b: Vec<f32>,
    pub ff_o_w: Tensor,
    pub ff_o_b: Vec<f32>,
    pub ln_out_w: Vec<f32>,
    pub ln_out_b: Vec<f32>,
}

pub struct Weights {
    pub word_embeddings: Tensor,
    pub token_type_embeddings: Tensor,
    pub position_embeddings: Tensor,
    pub norm_weight: Vec<f32>,
    pub norm_bias: Vec<f32>,
    pub layers: Vec<LayerWeights>,
    pub classifier_weight: Tensor,
    pub classifier_bias: Vec<f32>,
}

/// A loaded model. Immutable once built and shared between contexts.
pub struct Model {
    hparams: HParams,
    vocab: Vocabulary,
    weights: Weights,
}

impl Model {
    pub fn new(hparams: HParams, vocab: Vocabulary, weights: Weights) -> Self {
        Self {
            hparams,
            vocab,
            weights,
        }
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("hparams", &self.hparams)
            .field("vocab_size", &self.vocab.len())
            .field("layers", &self.weights.layers.len())
            .finish()
    }
}

/// Deterministic small-valued weights for unit tests; layer-norm scales are 1.
#[cfg(test)]
pub(crate) fn synthetic_model(hparams: HParams, vocab: &[&str]) -> Model {
    use crate::core::tensor::quant;

    let mut registry = TensorRegistry::for_hparams(&hparams);
    let names: Vec<String> = registry.names().map(str::to_string).collect();
    for (seed, name) in names.iter().enumerate() {
        let Some(t) = registry.fill(name) else { continue };
        let values: Vec<f32> = if name.contains("LayerNorm.weight") {
            vec![1.0; t.numel()]
        } else {
            (0..t.numel())
                .map(|i| (((i * 31 + seed * 17) % 23) as f32 - 11.0) * 0.05)
                .collect()
        };
        let mut bytes = Vec::with_capacity(t.nbytes());
        for row in values.chunks(t.ne0()) {
            quant::encode_row(t.dtype(), row, &mut bytes);
        }
        t.bytes_mut().copy_from_slice(&bytes);
    }
    let weights = registry.into_weights(&hparams).expect("all tensors declared");
    let vocab = Vocabulary::from_entries(vocab.iter().copied()).expect("vocabulary has markers");
    Model::new(hparams, vocab, weights)
}
