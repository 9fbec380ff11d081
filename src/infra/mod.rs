pub mod loader;
pub mod writer;

pub use loader::{load_model, read_model, MODEL_MAGIC};
pub use writer::ModelWriter;
