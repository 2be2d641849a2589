//! Custom error types for the engine.
//!
//! This module defines the primary error type, [`EngineError`], for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from camera transport problems to playback-file mismatches.
//!
//! Every variant maps onto one of the documented negative status codes of the
//! device API via [`EngineError::code`]; `0` is reserved for success. The
//! split between recoverable and fatal kinds drives the pipeline behavior:
//! recoverable errors (`NoImage`, `Calibrating`) are returned to the caller
//! and the last valid output is preserved, transport errors are retried in
//! the capture loop, and everything else short-circuits the session.

use std::path::PathBuf;

use thiserror::Error;

use crate::frame::CameraModel;

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Unified error type for capture, processing and playback.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No frame was available within the read timeout. Recoverable.
    #[error("no image available")]
    NoImage,

    /// Underlying I/O failure (file system, device node).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The camera is running its auto-calibration cycle. Transient.
    #[error("camera is calibrating")]
    Calibrating,

    /// Transport-level failure (USB/FTDI). Retried by the capture loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// A parameter value failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested operation does not apply to the active grab mode.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// The device or file could not be opened.
    #[error("open failed: {0}")]
    OpenFailed(String),

    /// The grab could not be started.
    #[error("grab start failed: {0}")]
    GrabStartFailed(String),

    /// Depth data could not be produced for the request.
    #[error("get depth failed")]
    GetDepthFailed,

    /// A playback file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// A playback file exists but could not be parsed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A playback file was recorded by a different camera model.
    #[error("camera model mismatch: file is {found:?}, device is {expected:?}")]
    ModelMismatch {
        /// The model the session is configured for.
        expected: CameraModel,
        /// The model found in the file header.
        found: CameraModel,
    },

    /// A required allocation failed.
    #[error("out of memory")]
    OutOfMemory,
}

impl EngineError {
    /// Returns the numeric status code for the device API surface.
    ///
    /// `0` means success and is never produced here; every error kind maps
    /// onto a distinct negative integer that stays stable across releases.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::NoImage => -1,
            EngineError::Io(_) => -2,
            EngineError::Calibrating => -3,
            EngineError::InvalidParameter(_) => -4,
            EngineError::InvalidMode(_) => -5,
            EngineError::OpenFailed(_) => -6,
            EngineError::GrabStartFailed(_) => -7,
            EngineError::GetDepthFailed => -8,
            EngineError::FileNotFound(_) => -9,
            EngineError::ReadFailed(_) => -10,
            EngineError::ModelMismatch { .. } => -11,
            EngineError::Transport(_) => -12,
            EngineError::OutOfMemory => -13,
        }
    }

    /// True for kinds the pipeline treats as transient: the caller gets the
    /// error back, the session stays alive and the last output is kept.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::NoImage | EngineError::Calibrating | EngineError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Transport("ftdi read timeout".to_string());
        assert_eq!(err.to_string(), "transport error: ftdi read timeout");
    }

    #[test]
    fn test_status_codes_are_negative_and_distinct() {
        let errors = [
            EngineError::NoImage,
            EngineError::Calibrating,
            EngineError::InvalidParameter("x".into()),
            EngineError::InvalidMode("x".into()),
            EngineError::OpenFailed("x".into()),
            EngineError::GrabStartFailed("x".into()),
            EngineError::GetDepthFailed,
            EngineError::FileNotFound(PathBuf::from("a.dat")),
            EngineError::ReadFailed("x".into()),
            EngineError::ModelMismatch {
                expected: CameraModel::Xc,
                found: CameraModel::Vm,
            },
            EngineError::Transport("x".into()),
            EngineError::OutOfMemory,
        ];
        let mut codes: Vec<i32> = errors.iter().map(EngineError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(EngineError::NoImage.is_recoverable());
        assert!(EngineError::Calibrating.is_recoverable());
        assert!(!EngineError::GetDepthFailed.is_recoverable());
    }
}
