//! LED current calibration and the drive values shared with the sampling context.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use serde::{Deserialize, Serialize};

/// One of the two excitation LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedChannel {
    One,
    Two,
}

impl LedChannel {
    pub const ALL: [LedChannel; 2] = [LedChannel::One, LedChannel::Two];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            LedChannel::One => 0,
            LedChannel::Two => 1,
        }
    }

    /// Parse a 1-based channel number as used on the command line and by the host.
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(LedChannel::One),
            2 => Some(LedChannel::Two),
            _ => None,
        }
    }
}

/// Affine mapping from a requested LED current (host units) to a DAC code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedCalibration {
    pub slope: f32,
    pub offset: f32,
}

impl Default for LedCalibration {
    fn default() -> Self {
        Self {
            slope: 38.15,
            offset: 6.26,
        }
    }
}

impl LedCalibration {
    /// Raw output code for `current`.
    ///
    /// Zero bypasses the calibration so "off" is exactly 0 whatever the offset.
    /// Values beyond the DAC range are left for the driver to deal with; the float
    /// conversion only saturates at the `u16` bounds.
    pub fn raw_value(&self, current: u16) -> u16 {
        if current == 0 {
            return 0;
        }
        (self.slope * f32::from(current) + self.offset).round() as u16
    }
}

/// Per-channel raw LED values, written by the control path and read by the
/// real-time sampling path.
#[derive(Debug, Default)]
pub struct LedDrive {
    raw: [AtomicU16; 2],
    pending: [AtomicBool; 2],
}

impl LedDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new raw value and mark it pending for contexts that apply changes eagerly.
    pub fn set(&self, channel: LedChannel, raw: u16) {
        let i = channel.index();
        self.raw[i].store(raw, Ordering::Relaxed);
        self.pending[i].store(true, Ordering::Release);
    }

    /// Calibrate `current` and store the result. Returns the raw value.
    pub fn set_current(&self, channel: LedChannel, current: u16, calibration: &LedCalibration) -> u16 {
        let raw = calibration.raw_value(current);
        self.set(channel, raw);
        raw
    }

    #[inline]
    pub fn raw(&self, channel: LedChannel) -> u16 {
        self.raw[channel.index()].load(Ordering::Relaxed)
    }

    /// The raw value if it changed since the last call, clearing the pending mark.
    #[inline]
    pub fn take_pending(&self, channel: LedChannel) -> Option<u16> {
        let i = channel.index();
        if self.pending[i].swap(false, Ordering::Acquire) {
            Some(self.raw[i].load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn clear_pending(&self) {
        for flag in &self.pending {
            flag.store(false, Ordering::Relaxed);
        }
    }
}
