//! 16-bit sample word encoding and oversampled reads.
//!
//! A sample word carries a 15-bit analog magnitude in bits 1..=15 and one
//! digital input bit in bit 0.

/// Largest magnitude representable in a sample word.
pub const MAX_MAGNITUDE: u16 = 0x7FFF;

/// Right shift applied to the sum of an oversampling burst.
///
/// A 64-reading burst of 12-bit values summed and shifted by 3 fits 15 bits. This is
/// a partial average (÷8, not ÷64); host-side calibration expects this scaling, so
/// it must not be changed without recalibrating against the hardware.
pub const OVERSAMPLE_SHIFT: u32 = 3;

/// Decoded view of a sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    pub magnitude: u16,
    pub digital: bool,
}

impl Sample {
    #[inline]
    pub fn new(magnitude: u16, digital: bool) -> Self {
        Self { magnitude, digital }
    }

    #[inline]
    pub fn encode(self) -> u16 {
        encode(self.magnitude, self.digital)
    }

    #[inline]
    pub fn from_word(word: u16) -> Self {
        let (magnitude, digital) = decode(word);
        Self { magnitude, digital }
    }
}

/// Pack a magnitude (clamped to 15 bits) and a digital bit into a sample word.
#[inline]
pub fn encode(magnitude: u16, digital: bool) -> u16 {
    (magnitude.min(MAX_MAGNITUDE) << 1) | u16::from(digital)
}

#[inline]
pub fn decode(word: u16) -> (u16, bool) {
    (word >> 1, word & 1 == 1)
}

/// Combine an oversampling burst into one magnitude.
#[inline]
pub fn oversampled_value(readings: &[u16]) -> u16 {
    let sum: u32 = readings.iter().map(|&r| u32::from(r)).sum();
    (sum >> OVERSAMPLE_SHIFT).min(u32::from(MAX_MAGNITUDE)) as u16
}

/// Baseline-subtracted magnitude, never negative.
#[inline]
pub fn subtract_baseline(sample: u16, baseline: u16) -> u16 {
    sample.saturating_sub(baseline)
}
