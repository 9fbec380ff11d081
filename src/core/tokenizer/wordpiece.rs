//! Greedy longest-match segmentation over the two vocabulary tables.
//!
//! Words are split on ASCII whitespace only. Within a word the first match
//! must come from the whole-word table and every later match from the
//! continuation table; characters nothing matches are dropped.

use super::Vocabulary;
use crate::core::model::TokenId;

/// Which table the next lookup inside a word consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordState {
    WholeWordPermitted,
    SubwordOnly,
}

/// Tokenizer output: ids including the sequence markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encoding {
    pub ids: Vec<TokenId>,
    /// Set when word content was discarded because the capacity ran out.
    pub truncated: bool,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The C `isspace` set.
pub fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
}

pub fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(is_separator).filter(|w| !w.is_empty())
}

/// Encodes `text` into at most `capacity` ids: `[CLS]`, word tokens, `[SEP]`.
pub fn tokenize(vocab: &Vocabulary, text: &str, capacity: usize) -> Encoding {
    if capacity < 2 {
        return Encoding {
            ids: Vec::new(),
            truncated: words(text).next().is_some(),
        };
    }
    let budget = capacity - 2;

    let mut ids = Vec::with_capacity(capacity.min(text.len() + 2));
    ids.push(vocab.bos());
    let mut emitted = 0usize;
    let mut truncated = false;

    'words: for word in words(text) {
        let bounds: Vec<usize> = word
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(word.len()))
            .collect();
        let n_chars = bounds.len() - 1;

        let mut state = WordState::WholeWordPermitted;
        let mut i = 0;
        while i < n_chars {
            if emitted >= budget {
                truncated = true;
                break 'words;
            }
            match longest_match(vocab, state, word, &bounds, i) {
                Some((id, end)) => {
                    ids.push(id);
                    emitted += 1;
                    i = end;
                }
                None => i += 1,
            }
            state = WordState::SubwordOnly;
        }
    }

    ids.push(vocab.eos());
    Encoding { ids, truncated }
}

/// Longest candidate starting at char `start` found in the table for `state`,
/// with the char index just past it.
fn longest_match(
    vocab: &Vocabulary,
    state: WordState,
    word: &str,
    bounds: &[usize],
    start: usize,
) -> Option<(TokenId, usize)> {
    let n_chars = bounds.len() - 1;
    (start + 1..=n_chars)
        .rev()
        .find_map(|end| vocab.lookup(state, &word[bounds[start]..bounds[end]]).map(|id| (id, end)))
}
