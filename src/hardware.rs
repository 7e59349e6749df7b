//! Capability traits for the peripherals the acquisition core drives.
//!
//! Register-level drivers implement these for a specific board; [`crate::sim`]
//! provides an in-memory board for tests and demos.

use std::io::{self, Read, Write};

use crate::errors::PhotometryError;
use crate::sampler::Sampler;

/// Analog input read in timed bursts.
pub trait AnalogInput: Send {
    /// Fill `readings` with consecutive conversions paced by the oversampling clock.
    fn read_oversampled(&mut self, readings: &mut [u16]);
}

pub trait DigitalInput: Send {
    fn read(&mut self) -> bool;
}

/// Analog output (12-bit DAC on the reference board) driving an LED.
pub trait AnalogOutput: Send {
    fn write(&mut self, value: u16);
}

/// Clock pacing the conversions of an oversampling burst.
pub trait OversamplingClock: Send {
    fn init(&mut self, frequency_hz: u32);
    fn deinit(&mut self);
}

/// Busy-wait for short settle times inside the sampling routine.
pub trait Delay: Send {
    fn delay_us(&mut self, us: u32);
}

/// A failed [`SamplingTimer::start`], with the sampler handed back untouched.
pub type TimerStartResult = std::result::Result<(), (PhotometryError, Sampler)>;

/// Periodic timer that invokes [`Sampler::tick`] from a real-time context.
///
/// The timer takes ownership of the sampler for the duration of the run and hands
/// it back on [`SamplingTimer::stop`], after the in-flight tick has completed. A
/// timer that cannot start returns the sampler with the error so the caller keeps
/// the peripherals.
pub trait SamplingTimer {
    fn start(&mut self, frequency_hz: u32, sampler: Sampler) -> TimerStartResult;
    fn stop(&mut self) -> Option<Sampler>;
}

/// Byte-oriented duplex link to the host.
pub trait HostLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Number of inbound bytes that can be read without blocking.
    fn available(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl HostLink for Box<dyn serialport::SerialPort> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

/// Everything the sampling routine touches, indexed by channel (0 = channel 1).
pub struct Frontend {
    pub analog: [Box<dyn AnalogInput>; 2],
    pub digital: [Box<dyn DigitalInput>; 2],
    pub leds: [Box<dyn AnalogOutput>; 2],
    pub oversampling_clock: Box<dyn OversamplingClock>,
    pub delay: Box<dyn Delay>,
}

impl Frontend {
    /// Switch both LEDs off.
    pub fn leds_off(&mut self) {
        for led in &mut self.leds {
            led.write(0);
        }
    }
}
