pub mod wordpiece;

pub use wordpiece::{tokenize, Encoding, WordState};

use crate::core::model::TokenId;
use crate::core::{NerError, Result};
use std::collections::HashMap;

pub const CONTINUATION_MARKER: &str = "##";
pub const BOS_TOKEN: &str = "[CLS]";
pub const EOS_TOKEN: &str = "[SEP]";
pub const UNK_TOKEN: &str = "[UNK]";

/// One vocabulary entry. Continuation pieces are stored without their marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Word(String),
    Continuation(String),
}

impl Piece {
    /// Classifies a raw entry: it continues a word iff it is longer than the
    /// marker and starts with it.
    pub fn parse(entry: &str) -> Self {
        match entry.strip_prefix(CONTINUATION_MARKER) {
            Some(rest) if !rest.is_empty() => Piece::Continuation(rest.to_string()),
            _ => Piece::Word(entry.to_string()),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Piece::Word(s) | Piece::Continuation(s) => s,
        }
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Piece::Continuation(_))
    }
}

/// Whole-word and continuation lookup tables over one shared id space.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    pieces: Vec<Piece>,
    words: HashMap<String, TokenId>,
    subwords: HashMap<String, TokenId>,
    bos: TokenId,
    eos: TokenId,
}

impl Vocabulary {
    /// Builds the tables from entries in id order. Later duplicates replace
    /// earlier ones in the lookup tables.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pieces = Vec::new();
        let mut words = HashMap::new();
        let mut subwords = HashMap::new();

        for (id, entry) in entries.into_iter().enumerate() {
            let piece = Piece::parse(entry.as_ref());
            let id = id as TokenId;
            match &piece {
                Piece::Word(s) => words.insert(s.clone(), id),
                Piece::Continuation(s) => subwords.insert(s.clone(), id),
            };
            pieces.push(piece);
        }

        let bos = *words
            .get(BOS_TOKEN)
            .ok_or_else(|| NerError::format(format!("vocabulary has no {} entry", BOS_TOKEN)))?;
        let eos = *words
            .get(EOS_TOKEN)
            .ok_or_else(|| NerError::format(format!("vocabulary has no {} entry", EOS_TOKEN)))?;

        Ok(Self {
            pieces,
            words,
            subwords,
            bos,
            eos,
        })
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn bos(&self) -> TokenId {
        self.bos
    }

    pub fn eos(&self) -> TokenId {
        self.eos
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn subword_count(&self) -> usize {
        self.subwords.len()
    }

    pub fn word_id(&self, word: &str) -> Option<TokenId> {
        self.words.get(word).copied()
    }

    pub fn subword_id(&self, piece: &str) -> Option<TokenId> {
        self.subwords.get(piece).copied()
    }

    pub fn lookup(&self, state: WordState, candidate: &str) -> Option<TokenId> {
        match state {
            WordState::WholeWordPermitted => self.word_id(candidate),
            WordState::SubwordOnly => self.subword_id(candidate),
        }
    }

    pub fn piece(&self, id: TokenId) -> Option<&Piece> {
        usize::try_from(id).ok().and_then(|idx| self.pieces.get(idx))
    }

    pub fn is_continuation(&self, id: TokenId) -> bool {
        self.piece(id).is_some_and(Piece::is_continuation)
    }

    /// Entry text as stored in the file, or `[UNK]` for unknown ids.
    pub fn token_text(&self, id: TokenId) -> String {
        match self.piece(id) {
            Some(Piece::Word(s)) => s.clone(),
            Some(Piece::Continuation(s)) => format!("{}{}", CONTINUATION_MARKER, s),
            None => UNK_TOKEN.to_string(),
        }
    }
}
