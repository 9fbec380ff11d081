pub mod runner;
pub mod service;
pub mod slot;

pub use runner::NerRunner;
pub use service::{service, NerService, RowResult, FUNCTION_NAMES, MODEL_PATH_OPTION};
pub use slot::ModelSlot;
