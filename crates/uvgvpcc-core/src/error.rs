//! Error types for uvgvpcc-core

use thiserror::Error;

/// The four error kinds the encoder can raise.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("input data error in frame {frame_id}: {message}")]
    InputData { frame_id: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl Clone for EncoderError {
    /// `std::io::Error` isn't `Clone`; I/O failures are re-described as an
    /// internal error when a cloned copy is needed (e.g. to hand a job's
    /// result to every thread waiting on it).
    fn clone(&self) -> Self {
        match self {
            EncoderError::Configuration(s) => EncoderError::Configuration(s.clone()),
            EncoderError::InputData { frame_id, message } => EncoderError::InputData {
                frame_id: *frame_id,
                message: message.clone(),
            },
            EncoderError::Io(e) => EncoderError::Internal(format!("io error: {e}")),
            EncoderError::Internal(s) => EncoderError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EncoderError>;
