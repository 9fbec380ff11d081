use crate::core::tensor::arena::scratch_elements;
use crate::core::tensor::{quant::QK4_0, DType};
use crate::core::{NerError, Result};
use std::fmt;

/// Header field selecting the encoding of the general-purpose weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantKind {
    F32,
    F16,
    Q4_0,
}

impl QuantKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(QuantKind::F32),
            1 => Some(QuantKind::F16),
            2 => Some(QuantKind::Q4_0),
            _ => None,
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            QuantKind::F32 => 0,
            QuantKind::F16 => 1,
            QuantKind::Q4_0 => 2,
        }
    }

    pub fn weight_dtype(&self) -> DType {
        match self {
            QuantKind::F32 => DType::F32,
            QuantKind::F16 => DType::F16,
            QuantKind::Q4_0 => DType::Q4_0,
        }
    }
}

impl fmt::Display for QuantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.weight_dtype(), f)
    }
}

/// Largest total weight storage a header may declare (8 GiB).
pub const MAX_WEIGHT_BYTES: u64 = 8 << 30;

/// Largest scratch arena, in f32 elements, a header may imply (4 GiB).
pub const MAX_SCRATCH_ELEMENTS: usize = 1 << 30;

/// Model hyperparameters, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HParams {
    pub n_vocab: usize,
    pub n_max_tokens: usize,
    pub n_embd: usize,
    pub n_intermediate: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub quant: QuantKind,
    pub n_labels: usize,
}

impl HParams {
    pub const FIELD_COUNT: usize = 8;

    /// Validates the raw header fields.
    pub fn from_header(raw: [i32; Self::FIELD_COUNT]) -> Result<Self> {
        let [n_vocab, n_max_tokens, n_embd, n_intermediate, n_head, n_layer, quant, n_labels] = raw;
        let quant = QuantKind::from_raw(quant)
            .ok_or_else(|| NerError::format(format!("unknown quantization kind {}", quant)))?;

        let positive = |name: &str, v: i32| -> Result<usize> {
            if v > 0 {
                Ok(v as usize)
            } else {
                Err(NerError::format(format!("{} must be positive, got {}", name, v)))
            }
        };
        if n_layer < 0 {
            return Err(NerError::format(format!("n_layer must not be negative, got {}", n_layer)));
        }

        let hparams = Self {
            n_vocab: positive("n_vocab", n_vocab)?,
            n_max_tokens: positive("n_max_tokens", n_max_tokens)?,
            n_embd: positive("n_embd", n_embd)?,
            n_intermediate: positive("n_intermediate", n_intermediate)?,
            n_head: positive("n_head", n_head)?,
            n_layer: n_layer as usize,
            quant,
            n_labels: positive("n_labels", n_labels)?,
        };
        hparams.validate()?;
        Ok(hparams)
    }

    pub fn to_header(&self) -> [i32; Self::FIELD_COUNT] {
        [
            self.n_vocab as i32,
            self.n_max_tokens as i32,
            self.n_embd as i32,
            self.n_intermediate as i32,
            self.n_head as i32,
            self.n_layer as i32,
            self.quant.raw(),
            self.n_labels as i32,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(NerError::format(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.quant == QuantKind::Q4_0
            && (self.n_embd % QK4_0 != 0 || self.n_intermediate % QK4_0 != 0)
        {
            return Err(NerError::format(format!(
                "q4_0 weights need n_embd and n_intermediate to be multiples of {}",
                QK4_0
            )));
        }
        if !self.weight_bytes().is_some_and(|b| b <= MAX_WEIGHT_BYTES) {
            return Err(NerError::format(format!(
                "declared weights exceed the {} byte limit",
                MAX_WEIGHT_BYTES
            )));
        }
        if !self.scratch_elements().is_some_and(|n| n <= MAX_SCRATCH_ELEMENTS) {
            return Err(NerError::format(format!(
                "scratch arena for {} tokens exceeds the {} element limit",
                self.n_max_tokens, MAX_SCRATCH_ELEMENTS
            )));
        }
        Ok(())
    }

    /// Total storage of every declared tensor, or `None` on overflow.
    pub fn weight_bytes(&self) -> Option<u64> {
        let wtype = self.quant.weight_dtype();
        let row_e = wtype.checked_row_bytes(self.n_embd)? as u64;
        let row_i = wtype.checked_row_bytes(self.n_intermediate)? as u64;
        let (e, i) = (self.n_embd as u64, self.n_intermediate as u64);
        let floats = |n: u64| n.checked_mul(4);

        let embed_rows = (self.n_vocab as u64)
            .checked_add(2)?
            .checked_add(self.n_max_tokens as u64)?;
        let embeddings = row_e.checked_mul(embed_rows)?.checked_add(floats(e.checked_mul(2)?)?)?;

        let layer = [
            row_e.checked_mul(e)?.checked_mul(4)?,
            row_e.checked_mul(i)?,
            row_i.checked_mul(e)?,
            floats(e.checked_mul(9)?.checked_add(i)?)?,
        ]
        .into_iter()
        .try_fold(0u64, u64::checked_add)?;
        let layers = layer.checked_mul(self.n_layer as u64)?;

        let labels = self.n_labels as u64;
        let classifier = row_e.checked_mul(labels)?.checked_add(floats(labels)?)?;

        embeddings.checked_add(layers)?.checked_add(classifier)
    }

    /// Scratch arena size in f32 elements, or `None` on overflow.
    pub fn scratch_elements(&self) -> Option<usize> {
        scratch_elements(
            self.n_max_tokens,
            self.n_embd,
            self.n_head,
            self.n_intermediate,
            self.n_labels,
        )
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

pub struct HParamsBuilder {
    hparams: HParams,
}

impl HParamsBuilder {
    pub fn new() -> Self {
        Self {
            hparams: HParams {
                n_vocab: 0,
                n_max_tokens: 16,
                n_embd: 32,
                n_intermediate: 64,
                n_head: 2,
                n_layer: 1,
                quant: QuantKind::F32,
                n_labels: 9,
            },
        }
    }

    pub fn n_vocab(mut self, n: usize) -> Self {
        self.hparams.n_vocab = n;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.hparams.n_max_tokens = n;
        self
    }

    pub fn embedding(mut self, n: usize) -> Self {
        self.hparams.n_embd = n;
        self
    }

    pub fn intermediate(mut self, n: usize) -> Self {
        self.hparams.n_intermediate = n;
        self
    }

    pub fn heads(mut self, n: usize) -> Self {
        self.hparams.n_head = n;
        self
    }

    pub fn layers(mut self, n: usize) -> Self {
        self.hparams.n_layer = n;
        self
    }

    pub fn quant(mut self, quant: QuantKind) -> Self {
        self.hparams.quant = quant;
        self
    }

    pub fn labels(mut self, n: usize) -> Self {
        self.hparams.n_labels = n;
        self
    }

    pub fn build(self) -> Result<HParams> {
        HParams::from_header(self.hparams.to_header())
    }
}

impl Default for HParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
