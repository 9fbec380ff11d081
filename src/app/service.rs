use super::runner::NerRunner;
use super::slot::ModelSlot;
use crate::core::{Entity, NerError, Result};
use crate::envconfig::EngineConfig;
use std::path::Path;

/// Names a host may register the extraction function under.
pub const FUNCTION_NAMES: [&str; 2] = ["ner", "ner_extract"];

pub const MODEL_PATH_OPTION: &str = "ner_model_path";

/// Outcome for one input row. `Ok(None)` marks a null input.
pub type RowResult = std::result::Result<Option<Vec<Entity>>, NerError>;

pub static SERVICE: once_cell::sync::Lazy<NerService> =
    once_cell::sync::Lazy::new(|| NerService::from_config(&EngineConfig::from_env()));

/// The process-wide service, configured from the environment on first use.
pub fn service() -> &'static NerService {
    &SERVICE
}

/// Row-batch entry point for hosts that call the extractor as a function
/// over columns of text.
pub struct NerService {
    slot: ModelSlot,
    threads: usize,
    truncate: bool,
}

impl NerService {
    pub fn new(threads: usize) -> Self {
        Self {
            slot: ModelSlot::new(),
            threads: threads.max(1),
            truncate: true,
        }
    }

    /// Builds a service and loads the configured model, if any. A model that
    /// fails to load leaves the service empty.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut service = Self::new(config.threads);
        service.truncate = config.truncate;
        if let Some(path) = &config.model_path {
            if let Err(e) = service.load(path) {
                tracing::warn!("could not load model {}: {}", path.display(), e);
            }
        }
        service
    }

    pub fn slot(&self) -> &ModelSlot {
        &self.slot
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_function(name: &str) -> bool {
        FUNCTION_NAMES.iter().any(|f| f.eq_ignore_ascii_case(name))
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        self.slot.load(path)
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        if !name.eq_ignore_ascii_case(MODEL_PATH_OPTION) {
            return Err(NerError::UnknownOption(name.to_string()));
        }
        self.load(value)
    }

    /// Runs `function` over a batch of rows.
    ///
    /// The whole batch sees the model that was active when the call began,
    /// even if another thread swaps it mid-batch. Without a model every
    /// non-null row yields an empty list.
    pub fn invoke(
        &self,
        function: &str,
        rows: &[Option<&str>],
        truncate: Option<bool>,
    ) -> Result<Vec<RowResult>> {
        if !Self::is_function(function) {
            return Err(NerError::UnknownFunction(function.to_string()));
        }
        let truncate = truncate.unwrap_or(self.truncate);

        let Some(ctx) = self.slot.current() else {
            tracing::debug!("no model loaded, returning empty results for {} rows", rows.len());
            return Ok(rows.iter().map(|row| Ok(row.map(|_| Vec::new()))).collect());
        };

        let runner = NerRunner::new(&ctx).threads(self.threads).truncate(truncate);
        Ok(rows
            .iter()
            .map(|row| match row {
                None => Ok(None),
                Some(text) => runner.run(text).map(Some),
            })
            .collect())
    }
}
