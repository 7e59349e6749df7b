//! Python bindings (feature `python`).

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::datafile::{self, DEFAULT_FILTER_HZ};
use crate::errors::FileFormatError;
use crate::host::{Chunk, ChunkBatch, Photometer};
use crate::led::LedChannel;
use crate::logging::set_log_level as set_rust_log_level;

fn file_error(e: FileFormatError) -> PyErr {
    match e {
        FileFormatError::Io(e) => PyErr::new::<PyIOError, _>(e.to_string()),
        other => PyErr::new::<PyValueError, _>(other.to_string()),
    }
}

/// One verified data chunk.
///
/// Attributes:
///     sequence: Chunk sequence number (wraps at 65536).
///     samples: Raw sample words, alternating channel 1 / channel 2.
#[pyclass(name = "Chunk", frozen, eq)]
#[derive(Clone, PartialEq, Eq)]
struct PyChunk {
    #[pyo3(get)]
    sequence: u16,
    #[pyo3(get)]
    samples: Vec<u16>,
}

#[pymethods]
impl PyChunk {
    fn __repr__(&self) -> String {
        format!(
            "Chunk(sequence={}, samples={})",
            self.sequence,
            self.samples.len()
        )
    }

    fn __len__(&self) -> usize {
        self.samples.len()
    }

    /// Analog magnitudes of one channel (1 or 2).
    fn analog(&self, channel: u8) -> PyResult<Vec<u16>> {
        let offset = channel_offset(channel)?;
        Ok(self.samples.iter().skip(offset).step_by(2).map(|w| w >> 1).collect())
    }

    /// Digital bits of one channel (1 or 2).
    fn digital(&self, channel: u8) -> PyResult<Vec<bool>> {
        let offset = channel_offset(channel)?;
        Ok(self.samples.iter().skip(offset).step_by(2).map(|w| w & 1 == 1).collect())
    }
}

fn channel_offset(channel: u8) -> PyResult<usize> {
    LedChannel::from_number(channel)
        .map(LedChannel::index)
        .ok_or_else(|| PyErr::new::<PyValueError, _>(format!("channel must be 1 or 2, got {channel}")))
}

impl From<Chunk> for PyChunk {
    fn from(c: Chunk) -> Self {
        PyChunk {
            sequence: c.sequence,
            samples: c.samples,
        }
    }
}

/// Chunks read in one call, with integrity statistics.
#[pyclass(name = "ChunkBatch", frozen)]
#[derive(Clone)]
struct PyChunkBatch {
    #[pyo3(get)]
    chunks: Vec<PyChunk>,
    #[pyo3(get)]
    timestamp_us: u64,
    #[pyo3(get)]
    checksum_errors: usize,
    #[pyo3(get)]
    sequence_gaps: usize,
}

#[pymethods]
impl PyChunkBatch {
    fn __repr__(&self) -> String {
        format!(
            "ChunkBatch(chunks={}, timestamp_us={}, checksum_errors={}, sequence_gaps={})",
            self.chunks.len(),
            self.timestamp_us,
            self.checksum_errors,
            self.sequence_gaps
        )
    }

    fn __len__(&self) -> usize {
        self.chunks.len()
    }

    #[getter]
    fn has_errors(&self) -> bool {
        self.checksum_errors > 0 || self.sequence_gaps > 0
    }
}

impl From<ChunkBatch> for PyChunkBatch {
    fn from(b: ChunkBatch) -> Self {
        PyChunkBatch {
            chunks: b.chunks.into_iter().map(PyChunk::from).collect(),
            timestamp_us: b.timestamp_us,
            checksum_errors: b.checksum_errors,
            sequence_gaps: b.sequence_gaps,
        }
    }
}

/// Serial driver for a streaming photometry board.
///
/// Example:
///     >>> board = Photometer("/dev/ttyACM0", buffer_size=256)
///     >>> board.set_led_current(1, 20)
///     >>> batch = board.read_timed(10)
///     >>> board.stop()
#[pyclass(name = "Photometer", unsendable)]
struct PyPhotometer {
    inner: Photometer,
}

#[pymethods]
impl PyPhotometer {
    #[new]
    #[pyo3(signature = (port, buffer_size=256))]
    fn new(port: &str, buffer_size: usize) -> PyResult<Self> {
        Photometer::connect_serial(port, buffer_size)
            .map(|inner| PyPhotometer { inner })
            .map_err(|e| PyErr::new::<PyIOError, _>(format!("{e:#}")))
    }

    /// Stop acquisition on the board.
    fn stop(&mut self) -> PyResult<()> {
        self.inner
            .stop()
            .map_err(|e| PyErr::new::<PyRuntimeError, _>(format!("{e:#}")))
    }

    /// Set the current of LED 1 or 2, in host units.
    fn set_led_current(&mut self, channel: u8, current: u16) -> PyResult<()> {
        let channel = LedChannel::from_number(channel)
            .ok_or_else(|| PyErr::new::<PyValueError, _>("channel must be 1 or 2"))?;
        self.inner
            .set_led_current(channel, current)
            .map_err(|e| PyErr::new::<PyRuntimeError, _>(format!("{e:#}")))
    }

    /// Read verified chunks.
    #[pyo3(signature = (n_chunks=1))]
    fn read(&mut self, n_chunks: usize) -> PyResult<Vec<PyChunk>> {
        self.inner
            .read_chunks(n_chunks)
            .map(|chunks| chunks.into_iter().map(PyChunk::from).collect())
            .map_err(|e| PyErr::new::<PyIOError, _>(format!("{e:#}")))
    }

    /// Read chunks with timing and error statistics.
    #[pyo3(signature = (n_chunks=1))]
    fn read_timed(&mut self, n_chunks: usize) -> PyResult<PyChunkBatch> {
        self.inner
            .read_chunks_timed(n_chunks)
            .map(PyChunkBatch::from)
            .map_err(|e| PyErr::new::<PyIOError, _>(format!("{e:#}")))
    }

    #[getter]
    fn buffer_size(&self) -> usize {
        self.inner.buffer_size()
    }

    fn __repr__(&self) -> String {
        format!("Photometer(buffer_size={})", self.inner.buffer_size())
    }
}

/// Load a recorded data file into a dictionary of header fields and signals.
#[pyfunction]
#[pyo3(signature = (file_path, filt_freq=DEFAULT_FILTER_HZ))]
fn import_data<'py>(py: Python<'py>, file_path: &str, filt_freq: f64) -> PyResult<Bound<'py, PyDict>> {
    let rec = datafile::import_data(file_path, filt_freq).map_err(file_error)?;
    let dict = PyDict::new(py);
    dict.set_item("subject_ID", &rec.header.subject_id)?;
    dict.set_item("datetime", rec.header.timestamp.to_string())?;
    dict.set_item("datetime_str", rec.header.timestamp.display_string())?;
    dict.set_item("mode", rec.header.mode.label())?;
    dict.set_item("sampling_rate", rec.header.sampling_rate)?;
    dict.set_item("volts_per_div", rec.volts_per_division.to_vec())?;
    dict.set_item("ADC1", rec.analog_1)?;
    dict.set_item("ADC2", rec.analog_2)?;
    dict.set_item("ADC1_filt", rec.analog_1_filtered)?;
    dict.set_item("ADC2_filt", rec.analog_2_filtered)?;
    dict.set_item("DI1", rec.digital_1)?;
    dict.set_item("DI2", rec.digital_2)?;
    dict.set_item("t", rec.time)?;
    Ok(dict)
}

static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

/// Forwards Rust log records to Python's `logging`, one logger per module path.
struct PyLogger {
    logging: Py<PyModule>,
}

impl PyLogger {
    fn py_level(level: log::Level) -> u32 {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }
}

impl Log for PyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let target = record.target().replace("::", ".");
        Python::attach(|py| {
            let result = self
                .logging
                .bind(py)
                .call_method1("getLogger", (target,))
                .and_then(|logger| {
                    logger.call_method1(
                        "log",
                        (Self::py_level(record.level()), record.args().to_string()),
                    )
                });
            if let Err(e) = result {
                e.restore(py);
            }
        });
    }

    fn flush(&self) {}
}

/// Route Rust logs into Python's `logging` module. Later calls are no-ops.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    if PY_LOGGER.get().is_none() {
        let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
            logging: py.import("logging")?.unbind(),
        }));
        if log::set_logger(logger).is_ok() {
            let _ = PY_LOGGER.set(logger);
        }
    }
    set_rust_log_level(level);
    Ok(())
}

/// Set the maximum Rust log level ("off", "error", ... "trace"); `None` re-reads
/// `PHOTOMETRY_LOG`/`RUST_LOG`.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) {
    set_rust_log_level(level);
}

/// Current maximum Rust log level.
#[pyfunction]
fn log_level() -> String {
    let level: LevelFilter = log::max_level();
    level.to_string().to_lowercase()
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyPhotometer>()?;
    m.add_class::<PyChunk>()?;
    m.add_class::<PyChunkBatch>()?;
    m.add_function(wrap_pyfunction!(import_data, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add_function(wrap_pyfunction!(log_level, m)?)?;

    m.add("DEFAULT_BUFFER_SIZE", 256usize)?;
    m.add("DEFAULT_FILTER_HZ", DEFAULT_FILTER_HZ)?;
    Ok(())
}
