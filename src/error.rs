// src/error.rs
//
// Crate-wide error type.
//
// Numeric trouble in the dissonance model is never an error: it is clamped
// or degenerates to a trivial result. These variants cover the boundaries
// to the outside world.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("invalid pitch name: {0:?}")]
    InvalidPitchName(String),

    #[error("pitch {0} is outside the MIDI range 0..=127")]
    PitchOutOfRange(i64),

    #[error("unknown tuning: {0:?}")]
    UnknownTuning(String),

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("sound output failed: {0}")]
    Output(String),

    #[error("tuning scheduler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TuningError>;
