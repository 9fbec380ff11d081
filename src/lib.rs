pub mod app;
pub mod core;
pub mod envconfig;
pub mod infra;

pub use crate::core::{
    decode, Context, DType, Encoding, Entity, HParams, HParamsBuilder, Model, NerError, Piece,
    QuantKind, Result, Tensor, TokenId, Vocabulary, LABEL_NAMES,
};

pub use infra::{load_model, read_model, ModelWriter, MODEL_MAGIC};

pub use app::{service, ModelSlot, NerRunner, NerService, RowResult};

pub use envconfig::EngineConfig;
