use std::io;
use thiserror::Error;

/// Errors raised by the acquisition core and its configuration calls.
#[derive(Debug, Error)]
pub enum PhotometryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid mode: {0:?}")]
    InvalidMode(String),
    #[error("acquisition mode has not been set")]
    ModeNotSet,
    #[error("invalid buffer size {0}: must be even and non-zero")]
    InvalidBufferSize(usize),
    #[error("invalid sampling rate {rate} Hz (maximum {max} Hz for this mode)")]
    InvalidSamplingRate { rate: u32, max: u32 },
    #[error("invalid opto-pulse timing: {0}")]
    OptoTiming(String),
    #[error("acquisition already running")]
    AlreadyRunning,
    #[error("acquisition not running")]
    NotRunning,
    #[error("sampling timer error: {0}")]
    Timer(String),
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Integrity problems a host detects in the received chunk stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("checksum mismatch in chunk {sequence}: computed {expected:#06X}, received {received:#06X}")]
    ChecksumMismatch {
        sequence: u16,
        expected: u16,
        received: u16,
    },
    #[error("sequence gap: expected chunk {expected}, received {received}")]
    SequenceGap { expected: u16, received: u16 },
    #[error("chunk has {got} bytes, expected {expected}")]
    Length { got: usize, expected: usize },
    #[error("chunk {sequence} terminator is {terminator:#06X}, expected 0")]
    Terminator { sequence: u16, terminator: u16 },
}

/// Errors decoding a recorded data file.
#[derive(Debug, Error)]
pub enum FileFormatError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("file too short: need {needed} bytes, have {got}")]
    TooShort { needed: usize, got: usize },
    #[error("unknown recording mode code {0}")]
    UnknownMode(u8),
    #[error("invalid timestamp {0:?}: expected YYYY-MM-DDTHH:MM:SS")]
    Timestamp(String),
    #[error("invalid subject id: {0}")]
    SubjectId(String),
    #[error("filter cutoff {cutoff} Hz must be positive and below Nyquist ({nyquist} Hz)")]
    Cutoff { cutoff: f64, nyquist: f64 },
}

pub type Result<T> = std::result::Result<T, PhotometryError>;
