//! Zero-phase low-pass filtering of decoded recordings.

use crate::errors::FileFormatError;

/// Padding used at each end by [`Biquad::filtfilt`], capped by the signal length.
const PAD_LEN: usize = 9;

/// Second-order IIR section, `a[0]` normalised to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Biquad {
    /// 2nd-order Butterworth low-pass via the bilinear transform with prewarping.
    pub fn butter_lowpass(cutoff_hz: f64, sample_rate_hz: f64) -> Result<Self, FileFormatError> {
        let nyquist = sample_rate_hz / 2.0;
        if !(cutoff_hz > 0.0 && cutoff_hz < nyquist) {
            return Err(FileFormatError::Cutoff {
                cutoff: cutoff_hz,
                nyquist,
            });
        }

        let k = (std::f64::consts::PI * cutoff_hz / sample_rate_hz).tan();
        let k2 = k * k;
        let norm = 1.0 + std::f64::consts::SQRT_2 * k + k2;
        let b0 = k2 / norm;
        Ok(Self {
            b: [b0, 2.0 * b0, b0],
            a: [
                1.0,
                2.0 * (k2 - 1.0) / norm,
                (1.0 - std::f64::consts::SQRT_2 * k + k2) / norm,
            ],
        })
    }

    /// Steady-state filter state for a unit step input.
    fn step_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let r1 = b1 - a1 * b0;
        let r2 = b2 - a2 * b0;
        let z0 = (r1 + r2) / (1.0 + a1 + a2);
        [z0, r2 - a2 * z0]
    }

    /// Transposed direct form II, starting from state `z`.
    fn run(&self, input: &[f64], mut z: [f64; 2]) -> Vec<f64> {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        input
            .iter()
            .map(|&x| {
                let y = b0 * x + z[0];
                z[0] = b1 * x - a1 * y + z[1];
                z[1] = b2 * x - a2 * y;
                y
            })
            .collect()
    }

    /// Forward-backward filtering with odd extension at both ends and
    /// steady-state initial conditions.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        if n < 2 {
            return signal.to_vec();
        }
        let pad = PAD_LEN.min(n - 1);
        let (first, last) = (signal[0], signal[n - 1]);

        let mut extended = Vec::with_capacity(n + 2 * pad);
        extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
        extended.extend_from_slice(signal);
        extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));

        let zi = self.step_state();
        let scaled = |x0: f64| [zi[0] * x0, zi[1] * x0];

        let mut forward = self.run(&extended, scaled(extended[0]));
        forward.reverse();
        let mut backward = self.run(&forward, scaled(forward[0]));
        backward.reverse();
        backward.drain(pad..pad + n).collect()
    }
}
