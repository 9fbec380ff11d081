use crate::core::{NerError, Result};

/// Fixed-capacity f32 working memory owned by a context.
///
/// Every forward pass opens a [`Frame`] and carves disjoint slices out of the
/// buffer; nothing survives the frame, so consecutive calls never observe each
/// other's intermediates.
pub struct ScratchArena {
    buf: Vec<f32>,
    high_water: usize,
}

impl ScratchArena {
    pub fn with_capacity(elements: usize) -> Self {
        Self {
            buf: vec![0.0; elements],
            high_water: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Largest number of elements any single frame has used so far.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn frame(&mut self) -> Frame<'_> {
        Frame {
            rest: &mut self.buf,
            used: 0,
            high_water: &mut self.high_water,
        }
    }
}

/// A bump allocator over the arena, valid for one evaluate call.
pub struct Frame<'a> {
    rest: &'a mut [f32],
    used: usize,
    high_water: &'a mut usize,
}

impl<'a> Frame<'a> {
    /// Hands out a zero-filled slice of `len` elements.
    pub fn alloc(&mut self, len: usize) -> Result<&'a mut [f32]> {
        let rest = std::mem::take(&mut self.rest);
        if len > rest.len() {
            let available = rest.len();
            self.rest = rest;
            return Err(NerError::ScratchExhausted {
                requested: len,
                available,
            });
        }
        let (head, tail) = rest.split_at_mut(len);
        self.rest = tail;
        self.used += len;
        if self.used > *self.high_water {
            *self.high_water = self.used;
        }
        head.fill(0.0);
        Ok(head)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

/// Arena size for a model: dense intermediates for a full-length sequence,
/// plus a quarter again as headroom. `None` if the count overflows `usize`.
pub fn scratch_elements(
    max_tokens: usize,
    n_embd: usize,
    n_head: usize,
    n_intermediate: usize,
    n_labels: usize,
) -> Option<usize> {
    let m = max_tokens;
    let dense = [
        m.checked_mul(n_embd)?.checked_mul(8)?,
        m.checked_mul(m)?.checked_mul(n_head)?,
        m.checked_mul(n_intermediate)?.checked_mul(2)?,
        m.checked_mul(n_labels)?,
    ]
    .into_iter()
    .try_fold(0usize, usize::checked_add)?;
    dense.checked_add(dense.div_ceil(4))
}
