//! The real-time sampling routine.
//!
//! [`Sampler::tick`] runs once per timer interrupt. It reads the photodetectors,
//! drives the LEDs, and pushes encoded sample words into the write buffer. It never
//! allocates, logs or takes a lock; everything it needs is set up by
//! [`Sampler::new`] before the timer starts.

use std::sync::Arc;

use crate::exchange::ChunkWriter;
use crate::hardware::Frontend;
use crate::led::{LedChannel, LedDrive};
use crate::opto::OptoPulse;
use crate::sample::{encode, oversampled_value, subtract_baseline};

/// Per-mode sampling scheme, dispatched once per tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Scheme {
    /// Both LEDs on; one read of each channel per tick.
    Continuous,
    /// LEDs alternate tick by tick with baseline subtraction.
    TimeDivision { channel_shared: bool },
    /// Time division with stimulation pulses on LED 1.
    OptoPulse(OptoPulse),
}

/// Peripherals and buffers the schemes share.
struct SamplerIo {
    frontend: Frontend,
    writer: ChunkWriter,
    leds: Arc<LedDrive>,
    readings: Box<[u16]>,
    settle_delay_us: u32,
}

pub struct Sampler {
    io: SamplerIo,
    scheme: Scheme,
}

impl Sampler {
    pub fn new(
        frontend: Frontend,
        writer: ChunkWriter,
        leds: Arc<LedDrive>,
        scheme: Scheme,
        oversampling_len: usize,
        settle_delay_us: u32,
    ) -> Self {
        Self {
            io: SamplerIo {
                frontend,
                writer,
                leds,
                readings: vec![0u16; oversampling_len.max(1)].into_boxed_slice(),
                settle_delay_us,
            },
            scheme,
        }
    }

    /// Put the LEDs in their start-of-run state.
    ///
    /// Continuous mode switches both LEDs on; time-division modes start dark and
    /// light each LED only for its own frame.
    pub fn prime(&mut self) {
        self.io.leds.clear_pending();
        match self.scheme {
            Scheme::Continuous => {
                for channel in LedChannel::ALL {
                    let raw = self.io.leds.raw(channel);
                    self.io.frontend.leds[channel.index()].write(raw);
                }
            }
            Scheme::TimeDivision { .. } | Scheme::OptoPulse(_) => self.io.frontend.leds_off(),
        }
    }

    /// One timer tick.
    #[inline]
    pub fn tick(&mut self) {
        match &mut self.scheme {
            Scheme::Continuous => self.io.continuous(),
            Scheme::TimeDivision { channel_shared } => self.io.time_division(*channel_shared, None),
            Scheme::OptoPulse(cycle) => {
                cycle.advance();
                self.io.time_division(false, Some(&*cycle));
            }
        }
    }

    pub fn write_index(&self) -> usize {
        self.io.writer.write_index()
    }

    /// Give the peripherals back; the partially filled write buffer is dropped.
    pub fn into_frontend(self) -> Frontend {
        self.io.frontend
    }
}

impl SamplerIo {
    #[inline]
    fn read(&mut self, input: usize) -> u16 {
        self.frontend.analog[input].read_oversampled(&mut self.readings);
        oversampled_value(&self.readings)
    }

    fn continuous(&mut self) {
        for channel in LedChannel::ALL {
            if let Some(raw) = self.leds.take_pending(channel) {
                self.frontend.leds[channel.index()].write(raw);
            }
        }

        let sample = self.read(0);
        let digital = self.frontend.digital[0].read();
        self.writer.push(encode(sample, digital));

        let sample = self.read(1);
        let digital = self.frontend.digital[1].read();
        // Buffer swap, if any, is the last thing this tick does.
        self.writer.push(encode(sample, digital));
    }

    /// Odd write indices are LED 2 frames, even ones LED 1 frames.
    fn time_division(&mut self, channel_shared: bool, opto: Option<&OptoPulse>) {
        let (channel, input) = if self.writer.write_index() % 2 == 1 {
            (LedChannel::Two, if channel_shared { 0 } else { 1 })
        } else {
            (LedChannel::One, 0)
        };
        let led = channel.index();

        let baseline = self.read(input);
        let raw = self.leds.raw(channel);
        let drive = match (channel, opto) {
            (LedChannel::One, Some(cycle)) => cycle.led_1_drive(raw),
            _ => raw,
        };
        self.frontend.leds[led].write(drive);
        self.frontend.delay.delay_us(self.settle_delay_us);

        let sample = self.read(input);
        self.frontend.leds[led].write(0);
        let digital = match (channel, opto) {
            (LedChannel::One, Some(cycle)) => cycle.in_pulse(),
            (LedChannel::Two, Some(cycle)) => cycle.is_cycle_marker(),
            (_, None) => self.frontend.digital[led].read(),
        };

        self.writer
            .push(encode(subtract_baseline(sample, baseline), digital));
    }
}
