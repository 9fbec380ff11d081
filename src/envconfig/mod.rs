use std::env;
use std::path::PathBuf;

pub const DEFAULT_THREADS: usize = 4;

/// Engine settings read from `NER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_path: Option<PathBuf>,
    pub threads: usize,
    pub truncate: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            model_path: lookup("NER_MODEL_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            threads: lookup("NER_THREADS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(DEFAULT_THREADS),
            truncate: lookup("NER_TRUNCATE")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            threads: DEFAULT_THREADS,
            truncate: true,
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
