use crate::core::{Context, Entity, NerError, Result};
use crate::envconfig::DEFAULT_THREADS;

/// Text in, entities out: tokenize, check for truncation, evaluate, decode.
pub struct NerRunner<'c> {
    ctx: &'c Context,
    threads: usize,
    truncate: bool,
}

impl<'c> NerRunner<'c> {
    pub fn new(ctx: &'c Context) -> Self {
        Self {
            ctx,
            threads: DEFAULT_THREADS,
            truncate: true,
        }
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// With `false`, text that does not fit the model is an error instead of
    /// being cut off.
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn run(&self, text: &str) -> Result<Vec<Entity>> {
        let capacity = self.ctx.n_max_tokens();
        let encoding = self.ctx.tokenize(text, capacity);
        if encoding.truncated && !self.truncate {
            return Err(NerError::TokenOverflow { capacity });
        }

        let logits = self.ctx.evaluate(self.threads, &encoding.ids)?;
        self.ctx.decode(&encoding.ids, &logits)
    }
}
