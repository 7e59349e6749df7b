//! In-memory board for tests, demos and host-side development.
//!
//! The simulated photodetectors respond linearly to the simulated LED outputs, so
//! baseline subtraction and LED scheduling produce predictable sample values.
//! Nothing here is real-time; [`ThreadTimer`] paces ticks with `thread::sleep`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::PhotometryError;
use crate::hardware::{
    AnalogInput, AnalogOutput, Delay, DigitalInput, Frontend, HostLink, OversamplingClock,
    SamplingTimer, TimerStartResult,
};
use crate::sampler::Sampler;

/// Full scale of the simulated 12-bit ADC.
const ADC_MAX: f32 = 4095.0;

/// Linear photodetector model: `dark + gain[0] * led_1 + gain[1] * led_2`, clamped
/// to the ADC range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detector {
    pub dark: f32,
    pub gain: [f32; 2],
}

impl Detector {
    pub fn new(dark: u16, gain: [f32; 2]) -> Self {
        Self {
            dark: f32::from(dark),
            gain,
        }
    }

    /// A detector that ignores the LEDs.
    pub fn constant(level: u16) -> Self {
        Self::new(level, [0.0, 0.0])
    }

    pub fn reading(&self, leds: [u16; 2]) -> u16 {
        let value = self.dark + self.gain[0] * f32::from(leds[0]) + self.gain[1] * f32::from(leds[1]);
        value.round().clamp(0.0, ADC_MAX) as u16
    }
}

#[derive(Debug, Default)]
struct BoardState {
    leds: [AtomicU16; 2],
    digital: [AtomicBool; 2],
    clock_hz: AtomicU32,
    delay_us: AtomicU64,
    reads: AtomicU64,
}

impl BoardState {
    fn leds(&self) -> [u16; 2] {
        [
            self.leds[0].load(Ordering::Relaxed),
            self.leds[1].load(Ordering::Relaxed),
        ]
    }
}

/// Handle on a simulated board. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct SimBoard {
    state: Arc<BoardState>,
    detectors: [Detector; 2],
}

impl SimBoard {
    pub fn new(detectors: [Detector; 2]) -> Self {
        Self {
            state: Arc::new(BoardState::default()),
            detectors,
        }
    }

    /// A board resembling a two-colour rig: each detector sees mostly its own LED.
    pub fn typical() -> Self {
        Self::new([Detector::new(120, [0.4, 0.02]), Detector::new(90, [0.03, 0.3])])
    }

    /// Peripheral set wired to this board.
    pub fn frontend(&self) -> Frontend {
        let analog = |i: usize| -> Box<dyn AnalogInput> {
            Box::new(SimAnalogInput {
                detector: self.detectors[i],
                state: Arc::clone(&self.state),
            })
        };
        let digital = |index: usize| -> Box<dyn DigitalInput> {
            Box::new(SimDigitalInput {
                index,
                state: Arc::clone(&self.state),
            })
        };
        let led = |index: usize| -> Box<dyn AnalogOutput> {
            Box::new(SimLed {
                index,
                state: Arc::clone(&self.state),
            })
        };
        Frontend {
            analog: [analog(0), analog(1)],
            digital: [digital(0), digital(1)],
            leds: [led(0), led(1)],
            oversampling_clock: Box::new(SimClock {
                state: Arc::clone(&self.state),
            }),
            delay: Box::new(SimDelay {
                state: Arc::clone(&self.state),
            }),
        }
    }

    /// Last value written to LED `index` (0 = LED 1).
    pub fn led(&self, index: usize) -> u16 {
        self.state.leds[index].load(Ordering::Relaxed)
    }

    pub fn set_digital(&self, index: usize, high: bool) {
        self.state.digital[index].store(high, Ordering::Relaxed);
    }

    /// Oversampling clock frequency, 0 while stopped.
    pub fn oversampling_clock_hz(&self) -> u32 {
        self.state.clock_hz.load(Ordering::Relaxed)
    }

    /// Total settle time requested by the sampling routine.
    pub fn delay_total_us(&self) -> u64 {
        self.state.delay_us.load(Ordering::Relaxed)
    }

    /// Number of oversampled reads performed.
    pub fn analog_reads(&self) -> u64 {
        self.state.reads.load(Ordering::Relaxed)
    }
}

struct SimAnalogInput {
    detector: Detector,
    state: Arc<BoardState>,
}

impl AnalogInput for SimAnalogInput {
    fn read_oversampled(&mut self, readings: &mut [u16]) {
        let value = self.detector.reading(self.state.leds());
        readings.fill(value);
        self.state.reads.fetch_add(1, Ordering::Relaxed);
    }
}

struct SimDigitalInput {
    index: usize,
    state: Arc<BoardState>,
}

impl DigitalInput for SimDigitalInput {
    fn read(&mut self) -> bool {
        self.state.digital[self.index].load(Ordering::Relaxed)
    }
}

struct SimLed {
    index: usize,
    state: Arc<BoardState>,
}

impl AnalogOutput for SimLed {
    fn write(&mut self, value: u16) {
        self.state.leds[self.index].store(value, Ordering::Relaxed);
    }
}

struct SimClock {
    state: Arc<BoardState>,
}

impl OversamplingClock for SimClock {
    fn init(&mut self, frequency_hz: u32) {
        self.state.clock_hz.store(frequency_hz, Ordering::Relaxed);
    }

    fn deinit(&mut self) {
        self.state.clock_hz.store(0, Ordering::Relaxed);
    }
}

struct SimDelay {
    state: Arc<BoardState>,
}

impl Delay for SimDelay {
    fn delay_us(&mut self, us: u32) {
        self.state.delay_us.fetch_add(u64::from(us), Ordering::Relaxed);
    }
}

/// Host link backed by two byte queues.
#[derive(Debug, Default)]
pub struct MemoryLink {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the host had sent them.
    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }
}

impl HostLink for MemoryLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.inbound.len());
        for (dst, src) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[derive(Default)]
struct TimerSlot {
    frequency_hz: u32,
    sampler: Option<Sampler>,
}

/// Timer whose ticks are fired explicitly, for deterministic tests.
///
/// Clones share the same slot, so a test can keep a handle after giving the
/// timer to the controller.
#[derive(Clone, Default)]
pub struct ManualTimer {
    slot: Arc<Mutex<TimerSlot>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one tick. Returns `false` if the timer is not running.
    pub fn fire(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.sampler.as_mut() {
            Some(sampler) => {
                sampler.tick();
                true
            }
            None => false,
        }
    }

    /// Run `n` ticks, returning how many ran.
    pub fn fire_n(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.fire()).count()
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sampler
            .is_some()
    }

    /// Frequency requested by the last start.
    pub fn frequency_hz(&self) -> u32 {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frequency_hz
    }
}

impl SamplingTimer for ManualTimer {
    fn start(&mut self, frequency_hz: u32, sampler: Sampler) -> TimerStartResult {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.sampler.is_some() {
            return Err((PhotometryError::Timer("timer already running".into()), sampler));
        }
        slot.frequency_hz = frequency_hz;
        slot.sampler = Some(sampler);
        Ok(())
    }

    fn stop(&mut self) -> Option<Sampler> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sampler
            .take()
    }
}

/// Timer that ticks the sampler from a dedicated thread at the requested rate.
#[derive(Default)]
pub struct ThreadTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Option<Sampler>>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SamplingTimer for ThreadTimer {
    fn start(&mut self, frequency_hz: u32, sampler: Sampler) -> TimerStartResult {
        if self.handle.is_some() {
            return Err((PhotometryError::Timer("timer already running".into()), sampler));
        }
        if frequency_hz == 0 {
            return Err((
                PhotometryError::Timer("timer frequency must be non-zero".into()),
                sampler,
            ));
        }

        let period = Duration::from_secs_f64(1.0 / f64::from(frequency_hz));
        let stop = Arc::clone(&self.stop);
        stop.store(false, Ordering::Release);

        // The sampler is sent once the thread exists, so a failed spawn can return it.
        let (tx, rx) = mpsc::channel::<Sampler>();
        let spawned = thread::Builder::new()
            .name("sampling-timer".into())
            .spawn(move || {
                let mut sampler = rx.recv().ok()?;
                let mut next = Instant::now() + period;
                let mut late = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else if now - next > period {
                        // Fell more than a tick behind; resynchronise instead of bursting.
                        late += 1;
                        next = now;
                    }
                    sampler.tick();
                    next += period;
                }
                if late > 0 {
                    warn!("sampling thread fell behind schedule {} time(s)", late);
                }
                Some(sampler)
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err((e.into(), sampler)),
        };
        if let Err(mpsc::SendError(sampler)) = tx.send(sampler) {
            let _ = handle.join();
            return Err((
                PhotometryError::Timer("sampling thread exited before starting".into()),
                sampler,
            ));
        }

        debug!("sampling thread started at {} Hz", frequency_hz);
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Option<Sampler> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        handle.join().ok().flatten()
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = SamplingTimer::stop(self);
        }
    }
}
