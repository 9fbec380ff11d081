use crate::core::decoder::{self, Entity};
use crate::core::model::{encoder, HParams, Model, TokenId};
use crate::core::tensor::ScratchArena;
use crate::core::tokenizer::{self, Encoding, Vocabulary};
use crate::core::{NerError, Result};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// A loaded model plus the scratch memory its forward passes run in.
///
/// Weights are shared; the arena is private. Overlapping `evaluate` calls on
/// one context take turns on the arena, while forks run independently.
pub struct Context {
    model: Arc<Model>,
    scratch: Mutex<ScratchArena>,
    pool: Mutex<Option<Arc<ThreadPool>>>,
}

impl Context {
    /// Loads a model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let model = crate::infra::loader::load_model(path.as_ref())?;
        Ok(Self::new(model))
    }

    /// Loads a model from an already opened stream.
    pub fn load_from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let model = crate::infra::loader::read_model(reader, Path::new("<reader>"))?;
        Ok(Self::new(model))
    }

    pub fn new(model: Model) -> Self {
        Self::from_shared(Arc::new(model))
    }

    pub fn from_shared(model: Arc<Model>) -> Self {
        // validated hyperparameters always have a size; anything else gets
        // an empty arena and fails at evaluate time
        let elements = model.hparams().scratch_elements().unwrap_or(0);
        tracing::debug!(
            "allocated scratch arena of {} elements ({} bytes)",
            elements,
            elements * std::mem::size_of::<f32>()
        );
        Self {
            model,
            scratch: Mutex::new(ScratchArena::with_capacity(elements)),
            pool: Mutex::new(None),
        }
    }

    /// Another context over the same weights with its own arena.
    pub fn fork(&self) -> Self {
        Self::from_shared(Arc::clone(&self.model))
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn hparams(&self) -> &HParams {
        self.model.hparams()
    }

    pub fn vocab(&self) -> &Vocabulary {
        self.model.vocab()
    }

    pub fn n_embd(&self) -> usize {
        self.hparams().n_embd
    }

    pub fn n_max_tokens(&self) -> usize {
        self.hparams().n_max_tokens
    }

    pub fn n_labels(&self) -> usize {
        self.hparams().n_labels
    }

    pub fn token_text(&self, id: TokenId) -> String {
        self.vocab().token_text(id)
    }

    pub fn scratch_capacity(&self) -> usize {
        self.scratch.lock().capacity()
    }

    pub fn tokenize(&self, text: &str, capacity: usize) -> Encoding {
        tokenizer::tokenize(self.vocab(), text, capacity)
    }

    /// Logits for `ids`, `n_labels` per token, token-major.
    pub fn evaluate(&self, threads: usize, ids: &[TokenId]) -> Result<Vec<f32>> {
        let mut logits = vec![0.0; ids.len() * self.n_labels()];
        self.evaluate_into(threads, ids, &mut logits)?;
        Ok(logits)
    }

    pub fn evaluate_into(&self, threads: usize, ids: &[TokenId], out: &mut [f32]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let threads = threads.max(1);
        let pool = self.pool(threads)?;

        let mut guard = self.scratch.lock();
        let arena: &mut ScratchArena = &mut guard;
        let model = &*self.model;
        let used = pool.install(|| -> Result<usize> {
            let mut frame = arena.frame();
            encoder::forward(model, &mut frame, ids, out)?;
            Ok(frame.used())
        })?;

        tracing::debug!(
            "evaluated {} tokens on {} threads: {} arena elements (peak {} of {}), {:?}",
            ids.len(),
            threads,
            used,
            arena.high_water(),
            arena.capacity(),
            started.elapsed()
        );
        Ok(())
    }

    /// Worker pool of `threads` workers, built on first use and rebuilt only
    /// when the requested count changes.
    fn pool(&self, threads: usize) -> Result<Arc<ThreadPool>> {
        let mut cached = self.pool.lock();
        if let Some(pool) = cached.as_ref().filter(|p| p.current_num_threads() == threads) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(
            ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| NerError::ThreadPool(e.to_string()))?,
        );
        tracing::debug!("built worker pool with {} threads", threads);
        *cached = Some(Arc::clone(&pool));
        Ok(pool)
    }

    pub fn decode(&self, ids: &[TokenId], logits: &[f32]) -> Result<Vec<Entity>> {
        decoder::decode(self.vocab(), ids, logits, self.n_labels())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("model", &self.model).finish()
    }
}
