//! Host-side driver for the acquisition board's serial stream.
//!
//! The board streams fixed-size chunks of `buffer_size` sample words followed by a
//! three-word trailer (sequence number, checksum, zero terminator), all
//! little-endian. This module reads those chunks, verifies them, and sends the
//! stop and LED current commands.
//!
//! # Timing
//!
//! Chunks carry no timestamps. Sample times are reconstructed on the host as
//! `start + index / sampling_rate`; sequence numbers reveal dropped chunks.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::errors::ChunkError;
use crate::led::LedChannel;
use crate::protocol::{checksum, chunk_len_bytes, Command};
use crate::sample::Sample;

/// Serial baud rate. The board's USB virtual COM port ignores it, but
/// `serialport` needs one.
const BAUD_RATE: u32 = 115200;

/// Default timeout for serial operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time for the board to leave its streaming loop after a stop command.
const STOP_DELAY: Duration = Duration::from_millis(200);

/// Largest sequence jump accepted for a chunk found while resynchronising.
const MAX_RESYNC_GAP: u16 = 64;

/// One verified chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk sequence number (wraps at 2^16).
    pub sequence: u16,
    pub checksum: u16,
    /// Sample words in acquisition order: channel 1, channel 2, channel 1, ...
    pub samples: Vec<u16>,
}

impl Chunk {
    /// Decoded samples of one channel (0 = channel 1).
    pub fn channel(&self, index: usize) -> impl Iterator<Item = Sample> + '_ {
        self.samples
            .iter()
            .skip(index)
            .step_by(2)
            .map(|&w| Sample::from_word(w))
    }
}

/// Result of reading several chunks, with integrity statistics.
#[derive(Debug, Clone, Default)]
pub struct ChunkBatch {
    pub chunks: Vec<Chunk>,
    /// Microseconds since the driver was created when the batch read started.
    pub timestamp_us: u64,
    /// Chunks discarded because the checksum or terminator did not match.
    pub checksum_errors: usize,
    /// Chunks missing according to sequence numbers.
    pub sequence_gaps: usize,
}

impl ChunkBatch {
    pub fn has_errors(&self) -> bool {
        self.checksum_errors > 0 || self.sequence_gaps > 0
    }
}

/// Decode and verify one chunk of `buffer_size` samples.
pub fn decode_chunk(bytes: &[u8], buffer_size: usize) -> std::result::Result<Chunk, ChunkError> {
    let expected = chunk_len_bytes(buffer_size);
    if bytes.len() != expected {
        return Err(ChunkError::Length {
            got: bytes.len(),
            expected,
        });
    }

    let mut words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    let trailer = words.split_off(buffer_size);
    let (sequence, received, terminator) = (trailer[0], trailer[1], trailer[2]);

    if terminator != 0 {
        return Err(ChunkError::Terminator {
            sequence,
            terminator,
        });
    }
    let computed = checksum(words.iter().copied());
    if computed != received {
        return Err(ChunkError::ChecksumMismatch {
            sequence,
            expected: computed,
            received,
        });
    }

    Ok(Chunk {
        sequence,
        checksum: received,
        samples: words,
    })
}

/// Tracks sequence numbers across chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `sequence` could plausibly follow the last observed chunk.
    pub fn is_plausible(&self, sequence: u16) -> bool {
        match self.last {
            Some(last) => (1..=MAX_RESYNC_GAP).contains(&sequence.wrapping_sub(last)),
            None => true,
        }
    }

    /// Record `sequence`; a discontinuity is reported as a gap.
    pub fn observe(&mut self, sequence: u16) -> std::result::Result<(), ChunkError> {
        let last = self.last.replace(sequence);
        match last {
            Some(last) if sequence != last.wrapping_add(1) => Err(ChunkError::SequenceGap {
                expected: last.wrapping_add(1),
                received: sequence,
            }),
            _ => Ok(()),
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Number of chunks missing for a gap error.
fn missing_chunks(error: &ChunkError) -> usize {
    match *error {
        ChunkError::SequenceGap { expected, received } => {
            usize::from(received.wrapping_sub(expected))
        }
        _ => 0,
    }
}

trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Driver for a streaming acquisition board.
///
/// # Example (Rust)
/// ```ignore
/// let mut board = Photometer::connect_serial("/dev/ttyACM0", 256)?;
/// board.set_led_current(LedChannel::One, 20)?;
/// let batch = board.read_chunks_timed(10)?;
/// println!("{} chunks, {} checksum errors", batch.chunks.len(), batch.checksum_errors);
/// board.stop()?;
/// ```
pub struct Photometer {
    transport: Box<dyn Transport>,
    buffer_size: usize,
    tracker: SequenceTracker,
    created: Instant,
    /// Bytes read from the transport and not yet consumed; starts at a chunk boundary.
    rx: Vec<u8>,
}

impl Photometer {
    /// Open the board's serial port. `buffer_size` must match the size the
    /// acquisition was started with.
    pub fn connect_serial(path: &str, buffer_size: usize) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open serial port at {}", path))?;
        debug!("Opened {} ({} samples per chunk)", path, buffer_size);
        Self::from_transport(port, buffer_size)
    }

    /// Wrap an already-open byte stream.
    pub fn from_transport<T>(transport: T, buffer_size: usize) -> Result<Self>
    where
        T: Read + Write + Send + 'static,
    {
        if buffer_size == 0 || buffer_size % 2 != 0 {
            anyhow::bail!("buffer size must be even and non-zero, got {}", buffer_size);
        }
        Ok(Self {
            transport: Box::new(transport),
            buffer_size,
            tracker: SequenceTracker::new(),
            created: Instant::now(),
            rx: Vec::with_capacity(2 * chunk_len_bytes(buffer_size)),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Microseconds since the driver was created.
    pub fn elapsed_us(&self) -> u64 {
        self.created.elapsed().as_micros() as u64
    }

    /// Ask the board to stop and discard whatever it sent before stopping.
    pub fn stop(&mut self) -> Result<()> {
        self.send(Command::Stop).context("Failed to send stop command")?;
        std::thread::sleep(STOP_DELAY);
        self.flush_input()?;
        self.rx.clear();
        self.tracker.reset();
        Ok(())
    }

    /// Set an LED current in host units; takes effect while streaming.
    pub fn set_led_current(&mut self, channel: LedChannel, current: u16) -> Result<()> {
        self.send(Command::SetLedCurrent { channel, current })
            .with_context(|| format!("Failed to set LED {:?} current", channel))
    }

    /// Read chunks, dropping any that fail verification.
    pub fn read_chunks(&mut self, n_chunks: usize) -> Result<Vec<Chunk>> {
        Ok(self.read_chunks_timed(n_chunks)?.chunks)
    }

    /// Read `n_chunks` chunk slots with timing and integrity statistics.
    ///
    /// A slot that fails verification is counted as a checksum error and the
    /// stream is realigned on the next valid chunk, so a slipped or stray byte
    /// costs one chunk rather than the rest of the session.
    pub fn read_chunks_timed(&mut self, n_chunks: usize) -> Result<ChunkBatch> {
        let timestamp_us = self.elapsed_us();
        let frame_len = chunk_len_bytes(self.buffer_size);
        let mut chunks = Vec::with_capacity(n_chunks);
        let mut checksum_errors = 0usize;
        let mut sequence_gaps = 0usize;

        for _ in 0..n_chunks {
            self.fill(frame_len).context("Failed to read chunk")?;

            match decode_chunk(&self.rx[..frame_len], self.buffer_size) {
                Ok(chunk) => {
                    self.rx.drain(..frame_len);
                    if let Err(gap) = self.tracker.observe(chunk.sequence) {
                        debug!("{}", gap);
                        sequence_gaps += missing_chunks(&gap);
                    }
                    chunks.push(chunk);
                }
                Err(e) => {
                    debug!("Discarding chunk: {}", e);
                    checksum_errors += 1;
                    let skipped = self.resync();
                    debug!("Skipped {} byte(s) to realign the chunk stream", skipped);
                }
            }
        }

        if checksum_errors > 0 {
            warn!(
                "Checksum errors in batch: {} (suppressing per-chunk logs)",
                checksum_errors
            );
        }
        if sequence_gaps > 0 {
            warn!(
                "Sequence gaps detected in batch: {} chunk(s) missing",
                sequence_gaps
            );
        }

        Ok(ChunkBatch {
            chunks,
            timestamp_us,
            checksum_errors,
            sequence_gaps,
        })
    }

    /// Read a single chunk; `None` if it failed verification.
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let batch = self.read_chunks_timed(1)?;
        Ok(batch.chunks.into_iter().next())
    }

    /// Make at least `len` bytes available in `rx`.
    fn fill(&mut self, len: usize) -> std::io::Result<()> {
        let start = self.rx.len();
        if start >= len {
            return Ok(());
        }
        self.rx.resize(len, 0);
        let result = self.transport.read_exact(&mut self.rx[start..]);
        if result.is_err() {
            self.rx.truncate(start);
        }
        result
    }

    /// Drop bytes from the front of `rx` until a valid chunk with a plausible
    /// sequence number starts there. Looks at most one chunk length ahead; if
    /// nothing lines up (or the stream runs dry) the bad chunk is dropped whole.
    /// Returns the number of bytes dropped.
    fn resync(&mut self) -> usize {
        let frame_len = chunk_len_bytes(self.buffer_size);
        for shift in 1..=frame_len {
            if self.fill(shift + frame_len).is_err() {
                break;
            }
            if let Ok(chunk) = decode_chunk(&self.rx[shift..shift + frame_len], self.buffer_size) {
                if self.tracker.is_plausible(chunk.sequence) {
                    self.rx.drain(..shift);
                    return shift;
                }
            }
        }
        let dropped = frame_len.min(self.rx.len());
        self.rx.drain(..dropped);
        dropped
    }

    fn send(&mut self, command: Command) -> Result<()> {
        self.transport.write_all(&command.to_bytes())?;
        self.transport.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let start = Instant::now();
        let max_flush = Duration::from_millis(200);
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if start.elapsed() > max_flush {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::sync::{Arc, Mutex};

    use crate::config::HardwareConfig;
    use crate::mode::Mode;
    use crate::photometry::{Photometry, PollEvent};
    use crate::sim::{Detector, ManualTimer, MemoryLink, SimBoard};

    /// Replays recorded bytes and captures what the driver writes.
    struct FakePort {
        rx: Cursor<Vec<u8>>,
        tx: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn port(rx: Vec<u8>) -> (FakePort, Arc<Mutex<Vec<u8>>>) {
        let tx = Arc::new(Mutex::new(Vec::new()));
        (
            FakePort {
                rx: Cursor::new(rx),
                tx: Arc::clone(&tx),
            },
            tx,
        )
    }

    /// Run the simulated board for `n_chunks` chunks and return the stream.
    fn device_stream(mode: Mode, buffer_size: usize, n_chunks: usize) -> Vec<u8> {
        let board = SimBoard::new([Detector::constant(100), Detector::constant(50)]);
        board.set_digital(0, true);
        let timer = ManualTimer::new();
        let mut photometry = Photometry::new(
            board.frontend(),
            Box::new(timer.clone()),
            HardwareConfig::default(),
        );
        photometry.set_mode(mode).unwrap();
        let mut streamer = photometry.begin(100, buffer_size).unwrap();
        let ticks = buffer_size / 2 * mode.ticks_per_sample() as usize;

        let mut link = MemoryLink::new();
        for _ in 0..n_chunks {
            timer.fire_n(ticks);
            assert!(matches!(streamer.poll(&mut link).unwrap(), PollEvent::ChunkSent(_)));
        }
        photometry.stop().unwrap();
        link.take_outbound()
    }

    #[test]
    fn test_reads_device_stream() {
        let stream = device_stream(Mode::ContinuousTwoColour, 8, 3);
        let (port, _tx) = port(stream);
        let mut photometer = Photometer::from_transport(port, 8).unwrap();

        let batch = photometer.read_chunks_timed(3).unwrap();
        assert!(!batch.has_errors());
        assert_eq!(
            batch.chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let chunk = &batch.chunks[0];
        assert!(chunk.channel(0).all(|s| s == Sample::new(800, true)));
        assert!(chunk.channel(1).all(|s| s == Sample::new(400, false)));
        assert_eq!(chunk.channel(0).count(), 4);
    }

    #[test]
    fn test_corrupted_chunk_is_counted_and_dropped() {
        let mut stream = device_stream(Mode::TimeDivisionTwoColour, 4, 3);
        // Flip a bit in the first sample of the second chunk.
        stream[chunk_len_bytes(4)] ^= 0x04;
        let (port, _tx) = port(stream);
        let mut photometer = Photometer::from_transport(port, 4).unwrap();

        let batch = photometer.read_chunks_timed(3).unwrap();
        assert_eq!(batch.checksum_errors, 1);
        assert_eq!(batch.chunks.len(), 2);
        // Chunk 2 was discarded, so 1 → 3 is also a gap of one.
        assert_eq!(batch.sequence_gaps, 1);
    }

    #[test]
    fn test_realigns_after_stray_leading_byte() {
        let mut stream = vec![0xAA];
        stream.extend(device_stream(Mode::ContinuousTwoColour, 8, 6));
        let (port, _tx) = port(stream);
        let mut photometer = Photometer::from_transport(port, 8).unwrap();

        let batch = photometer.read_chunks_timed(6).unwrap();
        assert_eq!(batch.checksum_errors, 1);
        assert_eq!(batch.sequence_gaps, 0);
        assert_eq!(
            batch.chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(photometer.read_chunk().unwrap().map(|c| c.sequence), Some(6));
    }

    #[test]
    fn test_realigns_after_lost_byte() {
        let mut stream = device_stream(Mode::ContinuousTwoColour, 8, 6);
        stream.remove(chunk_len_bytes(8) + 8);
        let (port, _tx) = port(stream);
        let mut photometer = Photometer::from_transport(port, 8).unwrap();

        let batch = photometer.read_chunks_timed(6).unwrap();
        assert_eq!(batch.checksum_errors, 1);
        assert_eq!(batch.sequence_gaps, 1);
        assert_eq!(
            batch.chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 3, 4, 5, 6]
        );
    }

    #[test]
    fn test_decode_chunk_errors() {
        let mut bytes = Vec::new();
        for w in [2u16, 4, 7, 0x1234, 0, 0] {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(
            decode_chunk(&bytes, 2),
            Err(ChunkError::Length { got: 12, expected: 10 })
        );
        assert_eq!(
            decode_chunk(&bytes[..10], 2),
            Err(ChunkError::ChecksumMismatch {
                sequence: 7,
                expected: 6,
                received: 0x1234
            })
        );

        let mut terminated = Vec::new();
        for w in [2u16, 4, 7, 6, 1] {
            terminated.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(
            decode_chunk(&terminated, 2),
            Err(ChunkError::Terminator {
                sequence: 7,
                terminator: 1
            })
        );
    }

    #[test]
    fn test_sequence_tracker_wraps_and_reports_gaps() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.observe(u16::MAX - 1).is_ok());
        assert!(tracker.observe(u16::MAX).is_ok());
        assert!(tracker.observe(0).is_ok());
        let gap = tracker.observe(3).unwrap_err();
        assert_eq!(gap, ChunkError::SequenceGap { expected: 1, received: 3 });
        assert_eq!(missing_chunks(&gap), 2);
        tracker.reset();
        assert!(tracker.is_plausible(7));
        assert!(tracker.observe(42).is_ok());
        assert!(tracker.is_plausible(43));
        assert!(tracker.is_plausible(42 + MAX_RESYNC_GAP));
        assert!(!tracker.is_plausible(42));
        assert!(!tracker.is_plausible(768));
    }

    #[test]
    fn test_commands_written_to_port() {
        let (port, tx) = port(Vec::new());
        let mut photometer = Photometer::from_transport(port, 2).unwrap();
        photometer.set_led_current(LedChannel::Two, 0x0102).unwrap();
        photometer.stop().unwrap();
        assert_eq!(*tx.lock().unwrap(), vec![0xFE, 0x02, 0x01, 0xFF]);
    }

    #[test]
    fn test_rejects_odd_buffer_size() {
        let (port, _tx) = port(Vec::new());
        assert!(Photometer::from_transport(port, 3).is_err());
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let (port, _tx) = port(vec![0u8; 5]);
        let mut photometer = Photometer::from_transport(port, 2).unwrap();
        assert!(photometer.read_chunk().is_err());
    }
}
