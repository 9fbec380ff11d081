pub mod context;
pub mod decoder;
pub mod error;
pub mod model;
pub mod tensor;
pub mod tokenizer;

pub use context::Context;
pub use decoder::{decode, Entity, LABEL_NAMES};
pub use error::NerError;
pub use model::{HParams, HParamsBuilder, Model, QuantKind, TokenId};
pub use tensor::{DType, Shape, Tensor};
pub use tokenizer::{Encoding, Piece, Vocabulary};

pub type Result<T> = std::result::Result<T, NerError>;
