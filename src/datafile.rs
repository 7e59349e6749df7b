//! Recorded data files: header layout, writer and decoder.
//!
//! ```text
//! u16le header_len
//! header (header_len bytes):
//!     [0..12)   subject id, ASCII, space padded
//!     [12..31)  start time, "YYYY-MM-DDTHH:MM:SS"
//!     [31]      recording mode code
//!     [32..34)  u16le sampling rate (Hz)
//!     [34..42)  2 x u32le volts per division (nV), one per channel
//! data: u16le sample words, alternating channel 1 / channel 2
//! ```

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use serde::Serialize;

use crate::errors::FileFormatError;
use crate::filter::Biquad;
use crate::mode::Mode;
use crate::sample::Sample;

pub const SUBJECT_ID_LEN: usize = 12;
pub const TIMESTAMP_LEN: usize = 19;
/// Header length written by [`RecordingWriter`].
pub const HEADER_LEN: usize = SUBJECT_ID_LEN + TIMESTAMP_LEN + 1 + 2 + 8;

/// Default low-pass cutoff applied by [`import_data`], in Hz.
pub const DEFAULT_FILTER_HZ: f64 = 20.0;

/// Fluorophore configuration stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordingMode {
    GcampRfp,
    GcampIso,
    GcampRfpDif,
}

impl RecordingMode {
    pub fn code(self) -> u8 {
        match self {
            RecordingMode::GcampRfp => 1,
            RecordingMode::GcampIso => 2,
            RecordingMode::GcampRfpDif => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FileFormatError> {
        match code {
            1 => Ok(RecordingMode::GcampRfp),
            2 => Ok(RecordingMode::GcampIso),
            3 => Ok(RecordingMode::GcampRfpDif),
            other => Err(FileFormatError::UnknownMode(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RecordingMode::GcampRfp => "GCaMP/RFP",
            RecordingMode::GcampIso => "GCaMP/iso",
            RecordingMode::GcampRfpDif => "GCaMP/RFP_dif",
        }
    }
}

impl From<Mode> for RecordingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::ContinuousTwoColour => RecordingMode::GcampRfp,
            Mode::TimeDivisionOneColour => RecordingMode::GcampIso,
            Mode::TimeDivisionTwoColour | Mode::OptoPulse => RecordingMode::GcampRfpDif,
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Wall-clock start time of a recording, second resolution, no time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    /// Current UTC time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_unix(secs)
    }

    pub fn from_unix(secs: u64) -> Self {
        let days = (secs / 86_400) as i64;
        let rem = secs % 86_400;

        // Days since 1970-01-01 to proleptic Gregorian date.
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = yoe + era * 400 + i64::from(month <= 2);

        Self {
            year: year as u16,
            month: month as u8,
            day: day as u8,
            hour: (rem / 3600) as u8,
            minute: (rem / 60 % 60) as u8,
            second: (rem % 60) as u8,
        }
    }

    /// `YYYY-MM-DD HH:MM:SS`, for display.
    pub fn display_string(&self) -> String {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl FromStr for Timestamp {
    type Err = FileFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FileFormatError::Timestamp(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != TIMESTAMP_LEN {
            return Err(invalid());
        }
        for (i, &c) in bytes.iter().enumerate() {
            let ok = match i {
                4 | 7 => c == b'-',
                10 => c == b'T',
                13 | 16 => c == b':',
                _ => c.is_ascii_digit(),
            };
            if !ok {
                return Err(invalid());
            }
        }
        let field = |range: std::ops::Range<usize>| -> u16 {
            bytes[range]
                .iter()
                .fold(0u16, |acc, &c| acc * 10 + u16::from(c - b'0'))
        };

        let ts = Self {
            year: field(0..4),
            month: field(5..7) as u8,
            day: field(8..10) as u8,
            hour: field(11..13) as u8,
            minute: field(14..16) as u8,
            second: field(17..19) as u8,
        };
        let valid = (1..=12).contains(&ts.month)
            && (1..=31).contains(&ts.day)
            && ts.hour < 24
            && ts.minute < 60
            && ts.second < 60;
        if valid {
            Ok(ts)
        } else {
            Err(invalid())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub subject_id: String,
    pub timestamp: Timestamp,
    pub mode: RecordingMode,
    pub sampling_rate: u16,
    /// Analog scale for each channel in nanovolts per division.
    pub volts_per_division_nv: [u32; 2],
}

impl FileHeader {
    /// Header bytes, without the length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FileFormatError> {
        let id = self.subject_id.as_bytes();
        if !self.subject_id.is_ascii() || id.len() > SUBJECT_ID_LEN {
            return Err(FileFormatError::SubjectId(format!(
                "{:?} must be ASCII and at most {} bytes",
                self.subject_id, SUBJECT_ID_LEN
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(id);
        bytes.resize(SUBJECT_ID_LEN, b' ');
        bytes.extend_from_slice(self.timestamp.to_string().as_bytes());
        bytes.push(self.mode.code());
        bytes.extend_from_slice(&self.sampling_rate.to_le_bytes());
        for nv in self.volts_per_division_nv {
            bytes.extend_from_slice(&nv.to_le_bytes());
        }
        Ok(bytes)
    }

    /// Parse header bytes. Trailing bytes beyond the known fields are ignored.
    pub fn parse(header: &[u8]) -> Result<Self, FileFormatError> {
        if header.len() < HEADER_LEN {
            return Err(FileFormatError::TooShort {
                needed: HEADER_LEN,
                got: header.len(),
            });
        }
        let subject_id = std::str::from_utf8(&header[..SUBJECT_ID_LEN])
            .map_err(|e| FileFormatError::SubjectId(e.to_string()))?
            .trim()
            .to_string();
        let ts_bytes = &header[SUBJECT_ID_LEN..SUBJECT_ID_LEN + TIMESTAMP_LEN];
        let timestamp = std::str::from_utf8(ts_bytes)
            .map_err(|_| FileFormatError::Timestamp(String::from_utf8_lossy(ts_bytes).into_owned()))?
            .parse()?;
        let mode = RecordingMode::from_code(header[31])?;
        let sampling_rate = u16::from_le_bytes([header[32], header[33]]);
        let nv = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);

        Ok(Self {
            subject_id,
            timestamp,
            mode,
            sampling_rate,
            volts_per_division_nv: [nv(34), nv(38)],
        })
    }
}

/// A decoded recording. Channel vectors are indexed by sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub header: FileHeader,
    /// Volts per division for each channel.
    pub volts_per_division: [f64; 2],
    pub analog_1: Vec<f64>,
    pub analog_2: Vec<f64>,
    pub analog_1_filtered: Vec<f64>,
    pub analog_2_filtered: Vec<f64>,
    pub digital_1: Vec<bool>,
    pub digital_2: Vec<bool>,
    /// Seconds since the start of the recording, one entry per channel 1 sample.
    pub time: Vec<f64>,
}

/// Summary of a recording, for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub subject_id: String,
    pub datetime: String,
    pub mode: RecordingMode,
    pub sampling_rate: u16,
    pub samples: usize,
    pub duration_s: f64,
    pub mean_volts: [f64; 2],
    pub digital_high: [usize; 2],
}

impl Recording {
    pub fn len(&self) -> usize {
        self.analog_1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analog_1.is_empty()
    }

    pub fn summary(&self) -> RecordingSummary {
        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        let high = |v: &[bool]| v.iter().filter(|&&d| d).count();
        RecordingSummary {
            subject_id: self.header.subject_id.clone(),
            datetime: self.header.timestamp.display_string(),
            mode: self.header.mode,
            sampling_rate: self.header.sampling_rate,
            samples: self.len(),
            duration_s: if self.header.sampling_rate == 0 {
                0.0
            } else {
                self.len() as f64 / f64::from(self.header.sampling_rate)
            },
            mean_volts: [mean(&self.analog_1), mean(&self.analog_2)],
            digital_high: [high(&self.digital_1), high(&self.digital_2)],
        }
    }
}

/// Decode a whole file held in memory, low-pass filtering at `filter_hz`.
pub fn parse_recording(bytes: &[u8], filter_hz: f64) -> Result<Recording, FileFormatError> {
    if bytes.len() < 2 {
        return Err(FileFormatError::TooShort {
            needed: 2,
            got: bytes.len(),
        });
    }
    let header_len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let data_start = 2 + header_len;
    if bytes.len() < data_start {
        return Err(FileFormatError::TooShort {
            needed: data_start,
            got: bytes.len(),
        });
    }
    let header = FileHeader::parse(&bytes[2..data_start])?;

    let data = &bytes[data_start..];
    if data.len() % 2 != 0 {
        warn!("Ignoring trailing odd byte in data section");
    }

    let volts_per_division = header.volts_per_division_nv.map(|nv| f64::from(nv) * 1e-9);
    let mut recording = Recording {
        header,
        volts_per_division,
        analog_1: Vec::with_capacity(data.len() / 4 + 1),
        analog_2: Vec::with_capacity(data.len() / 4),
        analog_1_filtered: Vec::new(),
        analog_2_filtered: Vec::new(),
        digital_1: Vec::with_capacity(data.len() / 4 + 1),
        digital_2: Vec::with_capacity(data.len() / 4),
        time: Vec::new(),
    };
    for (i, pair) in data.chunks_exact(2).enumerate() {
        let sample = Sample::from_word(u16::from_le_bytes([pair[0], pair[1]]));
        let ch = i % 2;
        let volts = f64::from(sample.magnitude) * volts_per_division[ch];
        if ch == 0 {
            recording.analog_1.push(volts);
            recording.digital_1.push(sample.digital);
        } else {
            recording.analog_2.push(volts);
            recording.digital_2.push(sample.digital);
        }
    }

    let rate = f64::from(recording.header.sampling_rate);
    let filter = Biquad::butter_lowpass(filter_hz, rate)?;
    recording.analog_1_filtered = filter.filtfilt(&recording.analog_1);
    recording.analog_2_filtered = filter.filtfilt(&recording.analog_2);
    recording.time = (0..recording.analog_1.len())
        .map(|i| i as f64 / rate)
        .collect();
    Ok(recording)
}

/// Load and decode a recorded file.
pub fn import_data(path: impl AsRef<Path>, filter_hz: f64) -> Result<Recording, FileFormatError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let recording = parse_recording(&bytes, filter_hz)?;
    debug!(
        "Imported {}: {} samples per channel at {} Hz",
        path.display(),
        recording.len(),
        recording.header.sampling_rate
    );
    Ok(recording)
}

/// Writes a header followed by streamed sample words.
pub struct RecordingWriter<W: Write> {
    inner: BufWriter<W>,
    words: usize,
}

impl RecordingWriter<File> {
    pub fn create(path: impl AsRef<Path>, header: &FileHeader) -> Result<Self, FileFormatError> {
        Self::new(File::create(path)?, header)
    }
}

impl<W: Write> RecordingWriter<W> {
    pub fn new(writer: W, header: &FileHeader) -> Result<Self, FileFormatError> {
        let header = header.to_bytes()?;
        let mut inner = BufWriter::new(writer);
        inner.write_all(&(header.len() as u16).to_le_bytes())?;
        inner.write_all(&header)?;
        Ok(Self { inner, words: 0 })
    }

    pub fn write_samples(&mut self, words: &[u16]) -> Result<(), FileFormatError> {
        for w in words {
            self.inner.write_all(&w.to_le_bytes())?;
        }
        self.words += words.len();
        Ok(())
    }

    /// Sample words written so far.
    pub fn words_written(&self) -> usize {
        self.words
    }

    /// Flush and return the underlying writer.
    pub fn finish(self) -> Result<W, FileFormatError> {
        self.inner
            .into_inner()
            .map_err(|e| FileFormatError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::encode;

    fn header() -> FileHeader {
        FileHeader {
            subject_id: "m042".to_string(),
            timestamp: "2024-03-05T14:07:09".parse().unwrap(),
            mode: RecordingMode::GcampIso,
            sampling_rate: 130,
            volts_per_division_nv: [100_700, 50_000],
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = header().to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..12], b"m042        ");
        assert_eq!(&bytes[12..31], b"2024-03-05T14:07:09");
        assert_eq!(bytes[31], 2);
        assert_eq!(&bytes[32..34], &[130, 0]);
        assert_eq!(FileHeader::parse(&bytes).unwrap(), header());
    }

    #[test]
    fn test_recorded_file_round_trip() {
        let n = 300usize;
        let mut words = Vec::with_capacity(2 * n);
        for i in 0..n {
            words.push(encode(1000, i % 10 == 0));
            words.push(encode(2000 + (i % 2) as u16, false));
        }
        let mut writer = RecordingWriter::new(Vec::new(), &header()).unwrap();
        writer.write_samples(&words[..100]).unwrap();
        writer.write_samples(&words[100..]).unwrap();
        assert_eq!(writer.words_written(), 2 * n);
        let bytes = writer.finish().unwrap();

        let recording = parse_recording(&bytes, DEFAULT_FILTER_HZ).unwrap();
        assert_eq!(recording.header, header());
        assert_eq!(recording.len(), n);
        assert_eq!(recording.analog_2.len(), n);
        assert!((recording.analog_1[0] - 1000.0 * 100_700e-9).abs() < 1e-12);
        assert!((recording.analog_2[1] - 2001.0 * 50_000e-9).abs() < 1e-12);
        assert_eq!(recording.digital_1.iter().filter(|&&d| d).count(), 30);
        assert!(recording.digital_2.iter().all(|&d| !d));
        assert!((recording.time[130] - 1.0).abs() < 1e-12);

        // Constant channel is unchanged by filtering.
        for y in &recording.analog_1_filtered {
            assert!((y - recording.analog_1[0]).abs() < 1e-9);
        }
        let summary = recording.summary();
        assert_eq!(summary.datetime, "2024-03-05 14:07:09");
        assert_eq!(summary.digital_high, [30, 0]);
    }

    #[test]
    fn test_odd_word_count_gives_channel_1_the_extra_sample() {
        let mut writer = RecordingWriter::new(Vec::new(), &header()).unwrap();
        writer.write_samples(&[encode(1, true), encode(2, false), encode(3, true)]).unwrap();
        let recording = parse_recording(&writer.finish().unwrap(), 20.0).unwrap();
        assert_eq!(recording.analog_1.len(), 2);
        assert_eq!(recording.analog_2.len(), 1);
        assert_eq!(recording.time.len(), 2);
    }

    #[test]
    fn test_malformed_files() {
        assert!(matches!(
            parse_recording(&[1], 20.0),
            Err(FileFormatError::TooShort { needed: 2, got: 1 })
        ));
        assert!(matches!(
            parse_recording(&[42, 0, 0, 0], 20.0),
            Err(FileFormatError::TooShort { needed: 44, got: 4 })
        ));

        let mut bytes = header().to_bytes().unwrap();
        bytes[31] = 9;
        let mut file = (bytes.len() as u16).to_le_bytes().to_vec();
        file.extend_from_slice(&bytes);
        assert!(matches!(
            parse_recording(&file, 20.0),
            Err(FileFormatError::UnknownMode(9))
        ));

        // 130 Hz sampling: Nyquist is 65 Hz.
        let mut writer = RecordingWriter::new(Vec::new(), &header()).unwrap();
        writer.write_samples(&[0, 0]).unwrap();
        assert!(matches!(
            parse_recording(&writer.finish().unwrap(), 65.0),
            Err(FileFormatError::Cutoff { .. })
        ));
    }

    #[test]
    fn test_header_validation() {
        let mut long = header();
        long.subject_id = "a-very-long-subject".to_string();
        assert!(matches!(long.to_bytes(), Err(FileFormatError::SubjectId(_))));

        for bad in ["2024-13-05T14:07:09", "2024-03-05 14:07:09", "24-03-05T14:07:09"] {
            assert!(matches!(
                bad.parse::<Timestamp>(),
                Err(FileFormatError::Timestamp(_))
            ));
        }
    }

    #[test]
    fn test_timestamp_from_unix() {
        assert_eq!(Timestamp::from_unix(0).to_string(), "1970-01-01T00:00:00");
        // 2000-02-29 leap day.
        assert_eq!(
            Timestamp::from_unix(951_782_400 + 3661).to_string(),
            "2000-02-29T01:01:01"
        );
        assert_eq!(
            Timestamp::from_unix(1_709_647_629).to_string(),
            "2024-03-05T14:07:09"
        );
    }
}
