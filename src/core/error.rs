use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NerError {
    #[error("failed to read model file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid model format: {0}")]
    Format(String),

    #[error("tensor '{name}' does not match its allocation: expected {expected}, found {found}")]
    TensorMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("input exceeds model token limit of {capacity} and truncate=false")]
    TokenOverflow { capacity: usize },

    #[error("sequence of {len} tokens exceeds the model maximum of {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("token id {0} is outside the vocabulary")]
    InvalidToken(i32),

    #[error("buffer too small: need {needed} elements, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("scratch arena exhausted: requested {requested} elements, {available} available")]
    ScratchExhausted { requested: usize, available: usize },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("unknown option: {0}")]
    UnknownOption(String),
}

impl NerError {
    pub fn format(msg: impl Into<String>) -> Self {
        NerError::Format(msg.into())
    }

    /// Maps a read failure on a model stream. End of stream inside a fixed
    /// section means the file is malformed, anything else is an IO failure.
    pub(crate) fn from_read(err: io::Error, path: &std::path::Path, section: &str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            NerError::Format(format!("unexpected end of file while reading {}", section))
        } else {
            NerError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    }

    pub fn is_format(&self) -> bool {
        matches!(self, NerError::Format(_) | NerError::TensorMismatch { .. })
    }

    pub fn is_io(&self) -> bool {
        matches!(self, NerError::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_eof_is_format_error() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let mapped = NerError::from_read(err, Path::new("m.bin"), "header");
        assert!(mapped.is_format());
        assert!(mapped.to_string().contains("header"));
    }

    #[test]
    fn test_other_read_error_is_io() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let mapped = NerError::from_read(err, Path::new("m.bin"), "vocabulary");
        assert!(mapped.is_io());
    }
}
