//! Two-channel fiber photometry acquisition.
//!
//! The device side drives two excitation LEDs, samples two photodetectors (plus
//! two digital event inputs) from a timer interrupt, and streams the samples to a
//! host in checksummed chunks. Three acquisition modes are supported:
//!
//! - continuous: both LEDs on, both detectors read every tick;
//! - time division: LEDs alternate tick by tick and each sample has the dark
//!   baseline taken just before the LED was switched on subtracted from it;
//! - opto-pulse: time division with periodic stimulation pulses on LED 1.
//!
//! Peripherals are reached through the traits in [`hardware`]; [`sim`] provides an
//! in-memory board. The host side ([`host`]) reads and verifies the chunk stream,
//! and [`datafile`] reads and writes recorded files.
//!
//! # Timing
//!
//! Chunks carry no timestamps. Sample `i` of a run was taken at
//! `start + i / sampling_rate`; a gap in chunk sequence numbers means whole
//! chunks were dropped.

pub mod config;
pub mod datafile;
pub mod errors;
pub mod exchange;
pub mod filter;
pub mod hardware;
pub mod host;
pub mod led;
pub mod logging;
pub mod mode;
pub mod opto;
pub mod photometry;
pub mod protocol;
pub mod sample;
pub mod sampler;
pub mod sim;

#[cfg(feature = "python")]
mod python;

pub use config::HardwareConfig;
pub use datafile::{import_data, FileHeader, Recording, RecordingMode, RecordingWriter, Timestamp};
pub use errors::*;
pub use host::{Chunk, ChunkBatch, Photometer};
pub use led::{LedCalibration, LedChannel};
pub use mode::{Mode, ModeConfig};
pub use photometry::{Photometry, PollEvent, Streamer};
pub use protocol::Command;
