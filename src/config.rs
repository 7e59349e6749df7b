//! Board-level constants: calibration, oversampling and opto-pulse timing.

use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::led::LedCalibration;

/// Oversampling clock frequencies in Hz.
///
/// Continuous mode reads both channels back to back in one tick and can afford a
/// faster burst; time-division modes wait for the LED to settle and use a slower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OversamplingRates {
    pub continuous: u32,
    pub time_division: u32,
}

impl Default for OversamplingRates {
    fn default() -> Self {
        Self {
            continuous: 256_000,
            time_division: 64_000,
        }
    }
}

/// Highest sampling rate each family of modes supports, in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingLimits {
    pub continuous: u32,
    pub time_division: u32,
}

impl Default for SamplingLimits {
    fn default() -> Self {
        Self {
            continuous: 1000,
            time_division: 160,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptoConfig {
    /// Stimulation pulse duration in milliseconds.
    pub pulse_ms: f32,
    /// Inter-pulse interval (pulse onset to pulse onset) in milliseconds.
    pub interval_ms: f32,
    /// LED 1 current multipliers, one per pulse, cycled in order.
    pub current_multipliers: Vec<f32>,
}

impl Default for OptoConfig {
    fn default() -> Self {
        Self {
            pulse_ms: 10.0,
            interval_ms: 1000.0,
            current_multipliers: vec![1.0, 2.0, 3.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub led_calibration: LedCalibration,
    pub oversampling_rate: OversamplingRates,
    /// Number of raw readings per oversampled read.
    pub oversampling_len: usize,
    /// Time between switching an LED on and reading the illuminated sample, in µs.
    pub settle_delay_us: u32,
    pub max_sampling_rate: SamplingLimits,
    pub opto: OptoConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            led_calibration: LedCalibration::default(),
            oversampling_rate: OversamplingRates::default(),
            oversampling_len: 64,
            settle_delay_us: 300,
            max_sampling_rate: SamplingLimits::default(),
            opto: OptoConfig::default(),
        }
    }
}

impl HardwareConfig {
    /// Parse a JSON document; omitted fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        debug!("Loaded hardware config from {}: {:?}", path.display(), config);
        Ok(config)
    }
}
