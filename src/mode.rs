//! Acquisition modes and the settings derived from them.

use std::fmt;
use std::str::FromStr;

use crate::config::HardwareConfig;
use crate::errors::PhotometryError;

/// Acquisition mode, fixed for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Both LEDs on continuously, each photodetector read once per sample.
    ContinuousTwoColour,
    /// LEDs alternate, both frames read from analog input 1.
    TimeDivisionOneColour,
    /// LEDs alternate, LED 1 frames read from input 1 and LED 2 frames from input 2.
    TimeDivisionTwoColour,
    /// Two-colour time division with periodic stimulation pulses on LED 1.
    OptoPulse,
}

impl Mode {
    pub const ALL: [Mode; 4] = [
        Mode::ContinuousTwoColour,
        Mode::TimeDivisionOneColour,
        Mode::TimeDivisionTwoColour,
        Mode::OptoPulse,
    ];

    /// Label used by the acquisition GUI and the device REPL.
    pub fn label(self) -> &'static str {
        match self {
            Mode::ContinuousTwoColour => "2 colour continuous",
            Mode::TimeDivisionOneColour => "1 colour time div.",
            Mode::TimeDivisionTwoColour => "2 colour time div.",
            Mode::OptoPulse => "opto-pulse",
        }
    }

    #[inline]
    pub fn is_continuous(self) -> bool {
        matches!(self, Mode::ContinuousTwoColour)
    }

    /// Both logical channels are read from the same physical analog input.
    #[inline]
    pub fn channel_shared(self) -> bool {
        matches!(self, Mode::TimeDivisionOneColour)
    }

    /// Timer ticks needed to produce one sample per channel.
    ///
    /// Time-division modes spend one tick per LED frame, so the timer runs at twice
    /// the sampling rate.
    #[inline]
    pub fn ticks_per_sample(self) -> u32 {
        if self.is_continuous() {
            1
        } else {
            2
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Mode {
    type Err = PhotometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "2 colour continuous" | "continuous" => Ok(Mode::ContinuousTwoColour),
            "1 colour time div." | "1-colour-time-div" => Ok(Mode::TimeDivisionOneColour),
            "2 colour time div." | "2-colour-time-div" => Ok(Mode::TimeDivisionTwoColour),
            "opto-pulse" => Ok(Mode::OptoPulse),
            other => Err(PhotometryError::InvalidMode(other.to_string())),
        }
    }
}

/// A validated mode together with the hardware settings it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub mode: Mode,
    /// Oversampling clock frequency in Hz.
    pub oversampling_rate: u32,
    pub channel_shared: bool,
    /// Highest accepted sampling rate in Hz.
    pub max_sampling_rate: u32,
}

impl ModeConfig {
    pub fn new(mode: Mode, config: &HardwareConfig) -> Self {
        let (oversampling_rate, max_sampling_rate) = if mode.is_continuous() {
            (
                config.oversampling_rate.continuous,
                config.max_sampling_rate.continuous,
            )
        } else {
            (
                config.oversampling_rate.time_division,
                config.max_sampling_rate.time_division,
            )
        };
        Self {
            mode,
            oversampling_rate,
            channel_shared: mode.channel_shared(),
            max_sampling_rate,
        }
    }

    /// Sampling timer frequency for a requested per-channel sampling rate.
    #[inline]
    pub fn timer_frequency(&self, sampling_rate: u32) -> u32 {
        sampling_rate * self.mode.ticks_per_sample()
    }
}
