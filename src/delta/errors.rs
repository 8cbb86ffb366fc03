//! Error variants for the delta decoder so callers can surface friendly failures.

use thiserror::Error;

/// Delta decoder error kinds exposed to callers.
#[derive(Error, Debug)]
pub enum GitDeltaError {
    /// The delta stream ended early or carried an unreadable varint.
    #[error("Delta stream truncated: {0}")]
    Truncated(#[from] std::io::Error),

    /// Failure while applying delta instructions.
    #[error("Delta decoder error: {0}")]
    DeltaDecoderError(String),
}
