//! Opto-pulse cycle state.
//!
//! Counts timer ticks over an inter-pulse interval. A pulse window opens when the
//! phase wraps to 0 and closes `pulse_len` ticks later, at which point the current
//! multiplier index advances. The first pulse of a run uses the first multiplier
//! and carries the cycle marker.

use crate::config::OptoConfig;
use crate::errors::{PhotometryError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct OptoPulse {
    pulse_len: u32,
    interval_len: u32,
    multipliers: Box<[f32]>,
    phase: u32,
    in_pulse: bool,
    multiplier_index: usize,
}

impl OptoPulse {
    /// Build the cycle for `sampling_rate`, with lengths counted in timer ticks
    /// (two per sample in time-division).
    pub fn new(config: &OptoConfig, sampling_rate: u32) -> Result<Self> {
        let ticks = |ms: f32| (2.0 * sampling_rate as f32 * ms / 1000.0) as u32;
        let pulse_len = ticks(config.pulse_ms);
        let interval_len = ticks(config.interval_ms);

        if config.current_multipliers.is_empty() {
            return Err(PhotometryError::OptoTiming(
                "current multiplier list is empty".into(),
            ));
        }
        if pulse_len == 0 || pulse_len >= interval_len {
            return Err(PhotometryError::OptoTiming(format!(
                "pulse of {} ticks does not fit an interval of {} ticks at {} Hz",
                pulse_len, interval_len, sampling_rate
            )));
        }

        let mut cycle = Self {
            pulse_len,
            interval_len,
            multipliers: config.current_multipliers.clone().into_boxed_slice(),
            phase: 0,
            in_pulse: false,
            multiplier_index: 0,
        };
        cycle.reset();
        Ok(cycle)
    }

    pub fn reset(&mut self) {
        self.phase = 0;
        self.in_pulse = false;
        self.multiplier_index = 0;
    }

    /// Advance one timer tick.
    #[inline]
    pub fn advance(&mut self) {
        self.phase = (self.phase + 1) % self.interval_len;
        if self.phase == 0 {
            self.in_pulse = true;
        } else if self.in_pulse && self.phase == self.pulse_len {
            self.in_pulse = false;
            self.multiplier_index = (self.multiplier_index + 1) % self.multipliers.len();
        }
    }

    #[inline]
    pub fn in_pulse(&self) -> bool {
        self.in_pulse
    }

    #[inline]
    pub fn multiplier_index(&self) -> usize {
        self.multiplier_index
    }

    #[inline]
    pub fn multiplier(&self) -> f32 {
        self.multipliers[self.multiplier_index]
    }

    /// Set during pulses that use the first multiplier; marks the start of a cycle.
    #[inline]
    pub fn is_cycle_marker(&self) -> bool {
        self.in_pulse && self.multiplier_index == 0
    }

    /// LED 1 drive for this tick: scaled by the active multiplier inside a pulse.
    #[inline]
    pub fn led_1_drive(&self, raw: u16) -> u16 {
        if self.in_pulse {
            (f32::from(raw) * self.multiplier()) as u16
        } else {
            raw
        }
    }

    pub fn pulse_len(&self) -> u32 {
        self.pulse_len
    }

    pub fn interval_len(&self) -> u32 {
        self.interval_len
    }
}
