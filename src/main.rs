use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use photometry::datafile::{import_data, FileHeader, RecordingMode, RecordingWriter, Timestamp};
use photometry::host::{decode_chunk, Photometer, SequenceTracker};
use photometry::logging::{init_rust_logging, set_log_level};
use photometry::sim::{MemoryLink, SimBoard, ThreadTimer};
use photometry::{HardwareConfig, LedChannel, Mode, Photometry, PollEvent, Streamer};

/// Volts per sample division for a 3.3 V, 12-bit ADC read through the 64-reading
/// oversampling burst, in nanovolts.
const VOLTS_PER_DIVISION_NV: u32 = 100_708;

#[derive(Parser, Debug)]
#[command(name = "photometry", about = "Fiber photometry acquisition tools")]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace); overrides PHOTOMETRY_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Hardware configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the acquisition core against the simulated board.
    Simulate(SimulateArgs),
    /// Record a stream from a board on a serial port.
    Record(RecordArgs),
    /// Decode a recorded file and print a summary.
    Import(ImportArgs),
}

#[derive(Args, Debug)]
struct Output {
    /// Data file to write.
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Subject id stored in the file header (at most 12 ASCII characters).
    #[arg(long, default_value = "subject")]
    subject: String,
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Acquisition mode, e.g. "continuous", "2-colour-time-div" or "opto-pulse".
    #[arg(long, default_value = "2 colour time div.")]
    mode: Mode,
    /// Sampling rate per channel in Hz.
    #[arg(long, default_value_t = 130)]
    rate: u32,
    /// Samples per chunk (even).
    #[arg(long, default_value_t = 256)]
    buffer_size: usize,
    /// Run time in seconds.
    #[arg(long, default_value_t = 5.0)]
    duration: f64,
    /// LED 1 current.
    #[arg(long, default_value_t = 20)]
    led1: u16,
    /// LED 2 current.
    #[arg(long, default_value_t = 20)]
    led2: u16,
    #[command(flatten)]
    output: Output,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Serial port of the board, e.g. /dev/ttyACM0.
    #[arg(long)]
    port: String,
    /// Samples per chunk the board was started with.
    #[arg(long, default_value_t = 256)]
    buffer_size: usize,
    /// Sampling rate the board was started with, for the file header.
    #[arg(long, default_value_t = 130)]
    rate: u16,
    /// Acquisition mode the board was started with, for the file header.
    #[arg(long, default_value = "2 colour time div.")]
    mode: Mode,
    /// Number of chunks to record.
    #[arg(long, default_value_t = 100)]
    chunks: usize,
    /// Set LED 1 current before recording.
    #[arg(long)]
    led1: Option<u16>,
    /// Set LED 2 current before recording.
    #[arg(long)]
    led2: Option<u16>,
    #[command(flatten)]
    output: Output,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Recorded data file.
    file: PathBuf,
    /// Low-pass filter cutoff in Hz.
    #[arg(long, default_value_t = 20.0)]
    filter_hz: f64,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_rust_logging();
    if cli.log_level.is_some() {
        set_log_level(cli.log_level.as_deref());
    }

    let config = match &cli.config {
        Some(path) => HardwareConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HardwareConfig::default(),
    };

    match cli.command {
        Command::Simulate(args) => simulate(args, config),
        Command::Record(args) => record(args),
        Command::Import(args) => import(args),
    }
}

fn open_writer(output: &Output, mode: Mode, rate: u16) -> Result<Option<RecordingWriter<File>>> {
    let Some(path) = &output.output else {
        return Ok(None);
    };
    let header = FileHeader {
        subject_id: output.subject.clone(),
        timestamp: Timestamp::now(),
        mode: RecordingMode::from(mode),
        sampling_rate: rate,
        volts_per_division_nv: [VOLTS_PER_DIVISION_NV; 2],
    };
    let writer = RecordingWriter::create(path, &header)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    info!("Writing {}", path.display());
    Ok(Some(writer))
}

fn simulate(args: SimulateArgs, config: HardwareConfig) -> Result<()> {
    let rate = u16::try_from(args.rate).context("Sampling rate does not fit the file header")?;
    let mut writer = open_writer(&args.output, args.mode, rate)?;

    let board = SimBoard::typical();
    let mut photometry = Photometry::new(board.frontend(), Box::new(ThreadTimer::new()), config);
    photometry.set_mode(args.mode)?;
    photometry.set_led_current(LedChannel::One, args.led1);
    photometry.set_led_current(LedChannel::Two, args.led2);

    let mut streamer = photometry.begin(args.rate, args.buffer_size)?;
    let deadline = Instant::now() + Duration::from_secs_f64(args.duration.max(0.0));
    let outcome = stream_until(&mut streamer, deadline, args.buffer_size, writer.as_mut());
    photometry.stop()?;
    let chunks = outcome?;

    println!(
        "{} chunks ({} samples per channel) in {} mode, {} overrun(s)",
        chunks,
        chunks * args.buffer_size / 2,
        args.mode,
        streamer.overruns()
    );
    if let Some(writer) = writer {
        writer.finish()?;
    }
    Ok(())
}

/// Poll the simulated stream until `deadline`, verifying each chunk and appending
/// it to `writer`. Returns the number of chunks received.
fn stream_until(
    streamer: &mut Streamer,
    deadline: Instant,
    buffer_size: usize,
    mut writer: Option<&mut RecordingWriter<File>>,
) -> Result<usize> {
    let mut link = MemoryLink::new();
    let mut tracker = SequenceTracker::new();
    let mut chunks = 0usize;
    while Instant::now() < deadline {
        match streamer.poll(&mut link)? {
            PollEvent::ChunkSent(_) => {
                let chunk = decode_chunk(&link.take_outbound(), buffer_size)?;
                if let Err(gap) = tracker.observe(chunk.sequence) {
                    warn!("{}", gap);
                }
                if let Some(writer) = writer.as_deref_mut() {
                    writer.write_samples(&chunk.samples)?;
                }
                chunks += 1;
            }
            _ => thread::sleep(Duration::from_millis(1)),
        }
    }
    Ok(chunks)
}

fn record(args: RecordArgs) -> Result<()> {
    let mut writer = open_writer(&args.output, args.mode, args.rate)?;
    let mut board = Photometer::connect_serial(&args.port, args.buffer_size)?;
    if let Some(current) = args.led1 {
        board.set_led_current(LedChannel::One, current)?;
    }
    if let Some(current) = args.led2 {
        board.set_led_current(LedChannel::Two, current)?;
    }

    let (mut received, mut checksum_errors, mut gaps) = (0usize, 0usize, 0usize);
    let mut remaining = args.chunks;
    while remaining > 0 {
        let n = remaining.min(10);
        let batch = board.read_chunks_timed(n)?;
        checksum_errors += batch.checksum_errors;
        gaps += batch.sequence_gaps;
        for chunk in &batch.chunks {
            if let Some(writer) = writer.as_mut() {
                writer.write_samples(&chunk.samples)?;
            }
        }
        received += batch.chunks.len();
        remaining -= n;
    }
    board.stop()?;

    println!(
        "{} chunks received, {} checksum error(s), {} missing chunk(s)",
        received, checksum_errors, gaps
    );
    if let Some(writer) = writer {
        writer.finish()?;
    }
    Ok(())
}

fn import(args: ImportArgs) -> Result<()> {
    let recording = import_data(&args.file, args.filter_hz)
        .with_context(|| format!("Failed to import {}", args.file.display()))?;
    let summary = recording.summary();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Subject:       {}", summary.subject_id);
    println!("Start:         {}", summary.datetime);
    println!("Mode:          {}", summary.mode);
    println!("Sampling rate: {} Hz", summary.sampling_rate);
    println!(
        "Samples:       {} per channel ({:.2} s)",
        summary.samples, summary.duration_s
    );
    for ch in 0..2 {
        println!(
            "Channel {}:     mean {:.6} V, digital high in {} sample(s)",
            ch + 1,
            summary.mean_volts[ch],
            summary.digital_high[ch]
        );
    }
    Ok(())
}
