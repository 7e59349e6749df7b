//! Acquisition controller and the streaming loop.
//!
//! [`Photometry`] owns the configuration, the LED drive values and (while idle)
//! the peripherals. [`Photometry::begin`] hands the peripherals to the sampling
//! timer and returns a [`Streamer`], the non-real-time half that transmits full
//! chunks and decodes host commands. [`Photometry::start`] runs both until the
//! host sends the stop byte.

use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use crate::config::HardwareConfig;
use crate::errors::{PhotometryError, Result};
use crate::exchange::{exchange, ChunkReader};
use crate::hardware::{Frontend, HostLink, SamplingTimer};
use crate::led::{LedCalibration, LedChannel, LedDrive};
use crate::mode::{Mode, ModeConfig};
use crate::opto::OptoPulse;
use crate::protocol::{Command, CommandDecoder};
use crate::sampler::{Sampler, Scheme};

/// Outcome of one [`Streamer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Nothing to send and no complete command received.
    Idle,
    /// A chunk was transmitted with this sequence number.
    ChunkSent(u16),
    /// An LED command was applied.
    Command(Command),
    /// The host asked to stop.
    Stop,
}

pub struct Photometry {
    config: HardwareConfig,
    mode: Option<ModeConfig>,
    leds: Arc<LedDrive>,
    frontend: Option<Frontend>,
    timer: Box<dyn SamplingTimer>,
    running: bool,
}

impl Photometry {
    pub fn new(frontend: Frontend, timer: Box<dyn SamplingTimer>, config: HardwareConfig) -> Self {
        Self {
            config,
            mode: None,
            leds: Arc::new(LedDrive::new()),
            frontend: Some(frontend),
            timer,
            running: false,
        }
    }

    pub fn config(&self) -> &HardwareConfig {
        &self.config
    }

    pub fn mode(&self) -> Option<&ModeConfig> {
        self.mode.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Raw drive value currently stored for `channel`.
    pub fn led_value(&self, channel: LedChannel) -> u16 {
        self.leds.raw(channel)
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if self.running {
            return Err(PhotometryError::AlreadyRunning);
        }
        let mode = ModeConfig::new(mode, &self.config);
        debug!(
            "Mode set to {} (oversampling {} Hz, channel shared: {})",
            mode.mode, mode.oversampling_rate, mode.channel_shared
        );
        self.mode = Some(mode);
        Ok(())
    }

    /// Set the mode from its label, e.g. `"2 colour time div."`.
    pub fn set_mode_str(&mut self, label: &str) -> Result<()> {
        self.set_mode(label.parse()?)
    }

    /// Calibrate and store an LED current. Returns the raw drive value.
    ///
    /// During continuous acquisition the sampling routine writes the new value to
    /// the LED on its next tick; time-division modes pick it up the next time the
    /// LED is driven.
    pub fn set_led_current(&mut self, channel: LedChannel, current: u16) -> u16 {
        let raw = self
            .leds
            .set_current(channel, current, &self.config.led_calibration);
        debug!("LED {:?} current {} -> raw {}", channel, current, raw);
        raw
    }

    /// Start acquisition at `sampling_rate` Hz per channel, streaming chunks of
    /// `buffer_size` samples.
    ///
    /// Validation happens before any peripheral is touched, so a rejected request
    /// leaves the controller idle and reusable.
    pub fn begin(&mut self, sampling_rate: u32, buffer_size: usize) -> Result<Streamer> {
        if self.running {
            return Err(PhotometryError::AlreadyRunning);
        }
        let mode = self.mode.ok_or(PhotometryError::ModeNotSet)?;
        if sampling_rate == 0 || sampling_rate > mode.max_sampling_rate {
            return Err(PhotometryError::InvalidSamplingRate {
                rate: sampling_rate,
                max: mode.max_sampling_rate,
            });
        }
        let scheme = match mode.mode {
            Mode::ContinuousTwoColour => Scheme::Continuous,
            Mode::TimeDivisionOneColour | Mode::TimeDivisionTwoColour => Scheme::TimeDivision {
                channel_shared: mode.channel_shared,
            },
            Mode::OptoPulse => Scheme::OptoPulse(OptoPulse::new(&self.config.opto, sampling_rate)?),
        };
        let (writer, reader) = exchange(buffer_size)?;

        let mut frontend = self.frontend.take().ok_or_else(|| {
            PhotometryError::Timer("peripherals were not returned by the sampling timer".into())
        })?;
        frontend.oversampling_clock.init(mode.oversampling_rate);

        let mut sampler = Sampler::new(
            frontend,
            writer,
            Arc::clone(&self.leds),
            scheme,
            self.config.oversampling_len,
            self.config.settle_delay_us,
        );
        sampler.prime();

        let timer_hz = mode.timer_frequency(sampling_rate);
        if let Err((e, sampler)) = self.timer.start(timer_hz, sampler) {
            warn!("Sampling timer failed to start: {}", e);
            self.restore(sampler);
            return Err(e);
        }
        self.running = true;
        info!(
            "Acquisition started: {} at {} Hz, {} samples per chunk (timer {} Hz)",
            mode.mode, sampling_rate, buffer_size, timer_hz
        );

        Ok(Streamer {
            reader,
            decoder: CommandDecoder::new(),
            leds: Arc::clone(&self.leds),
            calibration: self.config.led_calibration,
        })
    }

    /// Stop the sampling timer and oversampling clock and switch both LEDs off.
    ///
    /// Samples in the partially filled write buffer are discarded.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(PhotometryError::NotRunning);
        }
        self.running = false;
        match self.timer.stop() {
            Some(sampler) => {
                self.restore(sampler);
                info!("Acquisition stopped");
                Ok(())
            }
            None => {
                warn!("Sampling timer did not return the peripherals on stop");
                Err(PhotometryError::Timer("timer was not running".into()))
            }
        }
    }

    /// Take the peripherals back from a sampler, with the clock stopped and LEDs off.
    fn restore(&mut self, sampler: Sampler) {
        let mut frontend = sampler.into_frontend();
        frontend.oversampling_clock.deinit();
        frontend.leds_off();
        self.frontend = Some(frontend);
    }

    /// Acquire and stream over `link` until the host sends the stop byte.
    pub fn start<L>(&mut self, sampling_rate: u32, buffer_size: usize, link: &mut L) -> Result<()>
    where
        L: HostLink + ?Sized,
    {
        let mut streamer = self.begin(sampling_rate, buffer_size)?;
        loop {
            match streamer.poll(link) {
                Ok(PollEvent::Stop) => break,
                Ok(PollEvent::Idle) => thread::yield_now(),
                Ok(_) => {}
                Err(e) => {
                    warn!("Streaming failed: {}", e);
                    self.stop()?;
                    return Err(e);
                }
            }
        }
        if streamer.overruns() > 0 {
            warn!("{} chunk(s) were dropped during the run", streamer.overruns());
        }
        self.stop()
    }
}

/// Polling half of a running acquisition.
pub struct Streamer {
    reader: ChunkReader,
    decoder: CommandDecoder,
    leds: Arc<LedDrive>,
    calibration: LedCalibration,
}

impl Streamer {
    /// Send a ready chunk if there is one, otherwise consume at most one inbound
    /// command byte.
    pub fn poll<L>(&mut self, link: &mut L) -> Result<PollEvent>
    where
        L: HostLink + ?Sized,
    {
        if let Some(sequence) = self.reader.send_ready(link)? {
            return Ok(PollEvent::ChunkSent(sequence));
        }
        if link.available()? == 0 {
            return Ok(PollEvent::Idle);
        }

        let mut byte = [0u8; 1];
        if link.read(&mut byte)? == 0 {
            return Ok(PollEvent::Idle);
        }
        match self.decoder.feed(byte[0]) {
            Some(Command::Stop) => {
                debug!("Stop command received");
                Ok(PollEvent::Stop)
            }
            Some(command @ Command::SetLedCurrent { channel, current }) => {
                let raw = self.leds.set_current(channel, current, &self.calibration);
                debug!("LED {:?} current {} -> raw {} (running)", channel, current, raw);
                Ok(PollEvent::Command(command))
            }
            None => Ok(PollEvent::Idle),
        }
    }

    /// Sequence number of the last chunk sent.
    pub fn sequence(&self) -> u16 {
        self.reader.sequence()
    }

    pub fn overruns(&self) -> u32 {
        self.reader.overruns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::TimerStartResult;
    use crate::protocol::{chunk_len_bytes, CMD_LED_1, CMD_STOP};
    use crate::sim::{Detector, ManualTimer, MemoryLink, SimBoard};

    fn controller(board: &SimBoard) -> (Photometry, ManualTimer) {
        let timer = ManualTimer::new();
        let photometry = Photometry::new(
            board.frontend(),
            Box::new(timer.clone()),
            HardwareConfig::default(),
        );
        (photometry, timer)
    }

    fn trailer(bytes: &[u8], buffer_size: usize) -> (u16, u16, u16) {
        let word = |i: usize| u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        (word(buffer_size), word(buffer_size + 1), word(buffer_size + 2))
    }

    #[test]
    fn test_begin_requires_mode() {
        let board = SimBoard::typical();
        let (mut photometry, _timer) = controller(&board);
        assert!(matches!(photometry.begin(100, 8), Err(PhotometryError::ModeNotSet)));
    }

    #[test]
    fn test_invalid_requests_leave_controller_idle() {
        let board = SimBoard::typical();
        let (mut photometry, timer) = controller(&board);
        photometry.set_mode(Mode::TimeDivisionTwoColour).unwrap();

        assert!(matches!(
            photometry.begin(161, 8),
            Err(PhotometryError::InvalidSamplingRate { rate: 161, max: 160 })
        ));
        assert!(matches!(
            photometry.begin(0, 8),
            Err(PhotometryError::InvalidSamplingRate { .. })
        ));
        assert!(matches!(
            photometry.begin(100, 7),
            Err(PhotometryError::InvalidBufferSize(7))
        ));
        assert!(!photometry.is_running());
        assert!(!timer.is_running());

        // Still usable afterwards.
        photometry.begin(100, 8).unwrap();
        assert!(photometry.is_running());
    }

    #[test]
    fn test_invalid_mode_label() {
        let board = SimBoard::typical();
        let (mut photometry, _timer) = controller(&board);
        assert!(matches!(
            photometry.set_mode_str("3 colour"),
            Err(PhotometryError::InvalidMode(_))
        ));
        assert!(photometry.mode().is_none());
        photometry.set_mode_str("1 colour time div.").unwrap();
        assert!(photometry.mode().unwrap().channel_shared);
    }

    #[test]
    fn test_streams_sequential_chunks() {
        let board = SimBoard::new([Detector::constant(10), Detector::constant(20)]);
        let (mut photometry, timer) = controller(&board);
        photometry.set_mode(Mode::ContinuousTwoColour).unwrap();
        let mut streamer = photometry.begin(100, 8).unwrap();
        assert_eq!(timer.frequency_hz(), 100);
        assert_eq!(board.oversampling_clock_hz(), 256_000);

        let mut link = MemoryLink::new();
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::Idle);
        for expected in 1..=3u16 {
            assert_eq!(timer.fire_n(4), 4);
            assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::ChunkSent(expected));
            let bytes = link.take_outbound();
            assert_eq!(bytes.len(), chunk_len_bytes(8));
            // ch1 = 10 * 64 >> 3 = 80 → word 160; ch2 → 320.
            let (sequence, sum, terminator) = trailer(&bytes, 8);
            assert_eq!(sequence, expected);
            assert_eq!(sum, 4 * 160 + 4 * 320);
            assert_eq!(terminator, 0);
        }
        assert_eq!(streamer.sequence(), 3);
        assert_eq!(streamer.overruns(), 0);
    }

    #[test]
    fn test_stop_command_switches_leds_off() {
        let board = SimBoard::typical();
        let (mut photometry, timer) = controller(&board);
        photometry.set_mode(Mode::ContinuousTwoColour).unwrap();
        photometry.set_led_current(LedChannel::One, 10);
        photometry.set_led_current(LedChannel::Two, 20);
        let mut streamer = photometry.begin(500, 16).unwrap();
        assert_eq!(board.led(0), 388);
        assert_eq!(board.led(1), 769);

        let mut link = MemoryLink::new();
        assert_eq!(timer.fire_n(8), 8);
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::ChunkSent(1));

        // Part of the next chunk is in flight when the stop byte arrives.
        timer.fire_n(3);
        link.push_inbound(&[CMD_STOP]);
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::Stop);
        photometry.stop().unwrap();

        assert_eq!(board.led(0), 0);
        assert_eq!(board.led(1), 0);
        assert_eq!(board.oversampling_clock_hz(), 0);
        assert!(!photometry.is_running());

        // Nothing samples or sends after the stop.
        assert_eq!(timer.fire_n(32), 0);
        for _ in 0..4 {
            assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::Idle);
        }
        assert_eq!(link.outbound().len(), chunk_len_bytes(16));
        assert_eq!((board.led(0), board.led(1)), (0, 0));
        // The stored drive values survive for the next run.
        assert_eq!(photometry.led_value(LedChannel::One), 388);
    }

    /// Refuses to start the first `failures` times, then defers to `inner`.
    struct FlakyTimer {
        inner: ManualTimer,
        failures: usize,
    }

    impl SamplingTimer for FlakyTimer {
        fn start(&mut self, frequency_hz: u32, sampler: Sampler) -> TimerStartResult {
            if self.failures > 0 {
                self.failures -= 1;
                return Err((PhotometryError::Timer("no timer channel".into()), sampler));
            }
            self.inner.start(frequency_hz, sampler)
        }

        fn stop(&mut self) -> Option<Sampler> {
            self.inner.stop()
        }
    }

    #[test]
    fn test_failed_timer_start_releases_peripherals() {
        let board = SimBoard::typical();
        let timer = ManualTimer::new();
        let flaky = FlakyTimer {
            inner: timer.clone(),
            failures: 1,
        };
        let mut photometry = Photometry::new(board.frontend(), Box::new(flaky), HardwareConfig::default());
        photometry.set_mode(Mode::ContinuousTwoColour).unwrap();
        photometry.set_led_current(LedChannel::One, 20);
        photometry.set_led_current(LedChannel::Two, 20);

        assert!(matches!(
            photometry.begin(100, 8),
            Err(PhotometryError::Timer(ref m)) if m == "no timer channel"
        ));
        assert!(!photometry.is_running());
        assert_eq!((board.led(0), board.led(1)), (0, 0));
        assert_eq!(board.oversampling_clock_hz(), 0);
        assert!(matches!(photometry.stop(), Err(PhotometryError::NotRunning)));

        // The peripherals came back, so a retry runs normally.
        let mut streamer = photometry.begin(100, 8).unwrap();
        assert_eq!((board.led(0), board.led(1)), (769, 769));
        assert_eq!(timer.fire_n(4), 4);
        let mut link = MemoryLink::new();
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::ChunkSent(1));
        photometry.stop().unwrap();
        assert_eq!((board.led(0), board.led(1)), (0, 0));
    }

    #[test]
    fn test_led_command_applied_on_next_tick() {
        let board = SimBoard::typical();
        let (mut photometry, timer) = controller(&board);
        photometry.set_mode(Mode::ContinuousTwoColour).unwrap();
        let mut streamer = photometry.begin(100, 8).unwrap();
        assert_eq!(board.led(0), 0);

        let mut link = MemoryLink::new();
        link.push_inbound(&[CMD_LED_1, 10]);
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::Idle);
        assert_eq!(streamer.poll(&mut link).unwrap(), PollEvent::Idle);
        // Payload split across reads.
        link.push_inbound(&[0]);
        assert_eq!(
            streamer.poll(&mut link).unwrap(),
            PollEvent::Command(Command::SetLedCurrent {
                channel: LedChannel::One,
                current: 10
            })
        );
        assert_eq!(board.led(0), 0);
        timer.fire();
        assert_eq!(board.led(0), 388);
        assert_eq!(board.led(1), 0);
    }

    #[test]
    fn test_every_mode_produces_chunks() {
        for mode in Mode::ALL {
            let board = SimBoard::typical();
            let (mut photometry, timer) = controller(&board);
            photometry.set_mode(mode).unwrap();
            photometry.set_led_current(LedChannel::One, 20);
            photometry.set_led_current(LedChannel::Two, 20);
            let mut streamer = photometry.begin(100, 8).unwrap();
            assert_eq!(timer.frequency_hz(), 100 * mode.ticks_per_sample());

            let ticks_per_chunk = 8 / 2 * mode.ticks_per_sample() as usize;
            let mut link = MemoryLink::new();
            for expected in 1..=2u16 {
                timer.fire_n(ticks_per_chunk);
                assert_eq!(
                    streamer.poll(&mut link).unwrap(),
                    PollEvent::ChunkSent(expected),
                    "{mode}"
                );
            }
            assert_eq!(link.outbound().len(), 2 * chunk_len_bytes(8));
            photometry.stop().unwrap();
            assert_eq!((board.led(0), board.led(1)), (0, 0), "{mode}");
        }
    }

    #[test]
    fn test_state_errors() {
        let board = SimBoard::typical();
        let (mut photometry, _timer) = controller(&board);
        assert!(matches!(photometry.stop(), Err(PhotometryError::NotRunning)));

        photometry.set_mode(Mode::OptoPulse).unwrap();
        let _streamer = photometry.begin(100, 8).unwrap();
        assert!(matches!(
            photometry.set_mode(Mode::ContinuousTwoColour),
            Err(PhotometryError::AlreadyRunning)
        ));
        assert!(matches!(photometry.begin(100, 8), Err(PhotometryError::AlreadyRunning)));
        photometry.stop().unwrap();
        photometry.set_mode(Mode::ContinuousTwoColour).unwrap();
    }

    #[test]
    fn test_opto_timing_rejected_at_begin() {
        let board = SimBoard::typical();
        let mut config = HardwareConfig::default();
        config.opto.pulse_ms = 0.1;
        let mut photometry = Photometry::new(board.frontend(), Box::new(ManualTimer::new()), config);
        photometry.set_mode(Mode::OptoPulse).unwrap();
        assert!(matches!(
            photometry.begin(100, 8),
            Err(PhotometryError::OptoTiming(_))
        ));
        assert!(!photometry.is_running());
    }

    #[test]
    fn test_blocking_start_returns_on_stop_byte() {
        let board = SimBoard::typical();
        let (mut photometry, _timer) = controller(&board);
        photometry.set_mode(Mode::TimeDivisionTwoColour).unwrap();

        let mut link = MemoryLink::new();
        let mut bytes = Command::SetLedCurrent {
            channel: LedChannel::Two,
            current: 5,
        }
        .to_bytes();
        bytes.push(0x42);
        bytes.push(CMD_STOP);
        link.push_inbound(&bytes);

        photometry.start(100, 8, &mut link).unwrap();
        assert!(!photometry.is_running());
        assert_eq!(photometry.led_value(LedChannel::Two), 197);
        assert_eq!((board.led(0), board.led(1)), (0, 0));
        assert!(link.outbound().is_empty());
    }
}
