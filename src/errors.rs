//! Error types for the extraction pipeline
//!
//! Request-level failures surface as [`OcrError`]. Adapter failures are
//! [`EngineError`] values that the pipeline absorbs, and export failures are
//! kept separate in [`ExportError`] so extracted text survives them.

use std::time::Duration;
use thiserror::Error;

use crate::vision::engine::EngineKind;

/// Failures that abort a whole extraction request
#[derive(Debug, Clone, Error)]
pub enum OcrError {
    /// Process-wide engine initialization failed; replayed to every request
    #[error("OCR engines unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Image preprocessing failed: {0}")]
    PreprocessingFailed(String),

    #[error("Extraction cancelled")]
    Cancelled,

    #[error("Extraction timed out after {0:?}")]
    TimedOut(Duration),

    /// Worker panic or lost join handle
    #[error("Internal pipeline failure: {0}")]
    Internal(String),
}

/// Failures of a single OCR adapter
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{engine} engine is not installed: {reason}")]
    NotInstalled { engine: EngineKind, reason: String },

    #[error("{engine} engine invocation failed: {reason}")]
    InvocationFailed { engine: EngineKind, reason: String },

    #[error("{engine} engine produced unreadable output: {reason}")]
    InvalidOutput { engine: EngineKind, reason: String },
}

impl EngineError {
    /// Engine the failure belongs to
    pub fn engine(&self) -> EngineKind {
        match self {
            EngineError::NotInstalled { engine, .. }
            | EngineError::InvocationFailed { engine, .. }
            | EngineError::InvalidOutput { engine, .. } => *engine,
        }
    }

    pub(crate) fn invocation(engine: EngineKind, reason: impl ToString) -> Self {
        EngineError::InvocationFailed {
            engine,
            reason: reason.to_string(),
        }
    }
}

/// Document export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Document export failed: {0}")]
    DocumentExportFailed(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_reports_engine() {
        let err = EngineError::invocation(EngineKind::Classical, "exit status 1");
        assert_eq!(err.engine(), EngineKind::Classical);
        assert!(err.to_string().contains("exit status 1"));
    }

    #[test]
    fn test_unavailable_message() {
        let err = OcrError::EngineUnavailable("det.onnx missing".to_string());
        assert_eq!(err.to_string(), "OCR engines unavailable: det.onnx missing");
    }
}
