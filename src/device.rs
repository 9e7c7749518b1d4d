//! # Audio Devices
//!
//! The microphone and the speaker are hardware resources with exactly one owner
//! each: [`AudioCapture`](crate::audio::capture::AudioCapture) owns an
//! [`InputDevice`], [`AudioPlaybackQueue`](crate::audio::playback::AudioPlaybackQueue)
//! owns an [`OutputContext`]. Both traits are object safe so the engine can hold
//! `Box<dyn ...>` and tests can substitute doubles.
//!
//! ## Provided devices:
//! - [`WavFileInput`]: plays a WAV file into the pipeline in real time, then silence
//! - [`SilentInput`]: a microphone that hears nothing (still frames at full cadence)
//! - [`WavRecorderOutput`]: streams the scheduled playback timeline into a WAV file
//! - [`NullOutput`]: keeps time, discards audio
//!
//! Clocks are built on `tokio::time::Instant` so paused-time tests drive them.

use crate::audio::codec::{float_to_pcm, pcm_to_float, resample};
use crate::error::DeviceError;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const WAV_FORMAT_PCM: u16 = 1;
const WAV_FORMAT_IEEE_FLOAT: u16 = 3;

/// Timeline samples mixed per write while recording.
const RENDER_WINDOW: usize = 4096;

/// Blocks buffered between the device pump and the capture task.
const INPUT_CHANNEL_DEPTH: usize = 32;

/// A live input stream handed out by [`InputDevice::acquire`].
#[derive(Debug)]
pub struct InputStream {
    /// Native rate of the samples in `blocks`.
    pub sample_rate: u32,
    /// Mono float blocks at a fixed cadence, until the device is released.
    pub blocks: mpsc::Receiver<Vec<f32>>,
}

/// A microphone-like source of mono float samples.
pub trait InputDevice: Send {
    /// Open the device and start producing blocks of `block_size` samples.
    ///
    /// Fails with [`DeviceError::PermissionDenied`] when access is refused.
    fn acquire(&mut self, block_size: usize) -> Result<InputStream, DeviceError>;

    /// Stop producing blocks and release the hardware. Idempotent.
    fn release(&mut self);

    fn is_acquired(&self) -> bool;
}

/// A speaker-like sink that plays sample buffers at scheduled times.
///
/// Times are seconds on the context's own clock, which starts at zero when the
/// context is created and never goes backwards.
pub trait OutputContext: Send {
    fn current_time(&self) -> f64;

    /// Native rate of the output; scheduled buffers are converted to it.
    fn sample_rate(&self) -> u32;

    /// Play `samples` (at `sample_rate`) starting at `start_at` on the context clock.
    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> Result<(), DeviceError>;

    /// Cut off the sound that is playing now and forget everything not yet started.
    fn stop_all(&mut self);

    /// Tear the context down. Later `schedule` calls fail with [`DeviceError::Closed`].
    fn close(&mut self) -> Result<(), DeviceError>;

    fn is_closed(&self) -> bool;
}

/// Monotonic clock measuring seconds since creation.
#[derive(Debug, Clone, Copy)]
pub struct OutputClock {
    origin: Instant,
}

impl OutputClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that feeds `source` into `tx` in blocks, paced in real time.
///
/// When the source runs out the pump keeps going with silence, so capture
/// cadence never depends on what the microphone hears.
fn spawn_block_pump(
    source: Vec<f32>,
    sample_rate: u32,
    block_size: usize,
    tx: mpsc::Sender<Vec<f32>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut offset = 0;
        loop {
            ticker.tick().await;
            let block = if offset < source.len() {
                let end = (offset + block_size).min(source.len());
                let mut block = source[offset..end].to_vec();
                block.resize(block_size, 0.0);
                offset = end;
                block
            } else {
                vec![0.0; block_size]
            };

            if tx.send(block).await.is_err() {
                debug!("Input consumer dropped, stopping device pump");
                break;
            }
        }
    })
}

/// Microphone stand-in that streams a WAV file, then silence.
pub struct WavFileInput {
    path: PathBuf,
    pump: Option<JoinHandle<()>>,
}

impl WavFileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), pump: None }
    }
}

impl InputDevice for WavFileInput {
    fn acquire(&mut self, block_size: usize) -> Result<InputStream, DeviceError> {
        if self.pump.is_some() {
            return Err(DeviceError::Unavailable(format!(
                "{} is already in use",
                self.path.display()
            )));
        }

        let (samples, sample_rate) = read_wav_mono(&self.path)?;
        info!(
            path = %self.path.display(),
            sample_rate,
            seconds = samples.len() as f64 / sample_rate as f64,
            "Opened WAV input"
        );

        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        self.pump = Some(spawn_block_pump(samples, sample_rate, block_size.max(1), tx));
        Ok(InputStream { sample_rate, blocks: rx })
    }

    fn release(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            debug!(path = %self.path.display(), "Released WAV input");
        }
    }

    fn is_acquired(&self) -> bool {
        self.pump.is_some()
    }
}

impl Drop for WavFileInput {
    fn drop(&mut self) {
        self.release();
    }
}

/// Input that produces silence at the configured rate.
pub struct SilentInput {
    sample_rate: u32,
    pump: Option<JoinHandle<()>>,
}

impl SilentInput {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, pump: None }
    }
}

impl InputDevice for SilentInput {
    fn acquire(&mut self, block_size: usize) -> Result<InputStream, DeviceError> {
        if self.pump.is_some() {
            return Err(DeviceError::Unavailable("silent input already in use".into()));
        }
        if self.sample_rate == 0 {
            return Err(DeviceError::Format("sample rate must be positive".into()));
        }
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        self.pump = Some(spawn_block_pump(Vec::new(), self.sample_rate, block_size.max(1), tx));
        Ok(InputStream { sample_rate: self.sample_rate, blocks: rx })
    }

    fn release(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn is_acquired(&self) -> bool {
        self.pump.is_some()
    }
}

impl Drop for SilentInput {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read a WAV file and mix it down to mono floats.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), DeviceError> {
    let mut file = File::open(path).map_err(|e| DeviceError::from_open_error(e, &path.display().to_string()))?;
    let (header, data) = wav::read(&mut file)?;

    if header.sampling_rate == 0 || header.channel_count == 0 {
        return Err(DeviceError::Format("WAV header has zero rate or channels".into()));
    }
    if header.audio_format != WAV_FORMAT_PCM && header.audio_format != WAV_FORMAT_IEEE_FLOAT {
        return Err(DeviceError::Format(format!(
            "unsupported WAV format tag {}",
            header.audio_format
        )));
    }

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| pcm_to_float(s)).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    let channels = header.channel_count as usize;
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, header.sampling_rate))
}

/// Write mono floats as a 16-bit PCM WAV file.
pub fn write_wav_mono(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), DeviceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path).map_err(|e| DeviceError::from_open_error(e, &path.display().to_string()))?;
    let header = wav::Header::new(WAV_FORMAT_PCM, 1, sample_rate, 16);
    let pcm: Vec<i16> = samples.iter().map(|&s| float_to_pcm(s)).collect();
    wav::write(header, &wav::BitDepth::Sixteen(pcm), &mut file)?;
    Ok(())
}

/// Write a 44-byte header for mono 16-bit PCM with `data_len` bytes of samples.
fn write_pcm16_header<W: Write>(out: &mut W, sample_rate: u32, data_len: u32) -> std::io::Result<()> {
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(WAV_FORMAT_PCM)?;
    out.write_u16::<LittleEndian>(1)?;
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(sample_rate * 2)?;
    out.write_u16::<LittleEndian>(2)?;
    out.write_u16::<LittleEndian>(16)?;
    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)
}

/// A buffer placed on the output timeline, positioned in output samples.
#[derive(Debug, Clone)]
struct ScheduledSource {
    offset: usize,
    samples: Vec<f32>,
}

impl ScheduledSource {
    fn end(&self) -> usize {
        self.offset + self.samples.len()
    }
}

/// Output that records what would have been heard into a WAV file.
///
/// Everything before the context clock is final, so each call writes the
/// settled part of the timeline and forgets sources that are fully written.
/// The header sizes are patched on close.
pub struct WavRecorderOutput {
    path: PathBuf,
    sample_rate: u32,
    clock: OutputClock,
    sources: Vec<ScheduledSource>,
    writer: Option<BufWriter<File>>,
    /// Timeline samples already on disk.
    written: usize,
    closed: bool,
}

impl WavRecorderOutput {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            clock: OutputClock::new(),
            sources: Vec::new(),
            writer: None,
            written: 0,
            closed: false,
        }
    }

    fn settled(&self) -> usize {
        (self.clock.now() * self.sample_rate as f64).floor() as usize
    }

    fn open_writer(&mut self) -> Result<(), DeviceError> {
        if self.writer.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)
            .map_err(|e| DeviceError::from_open_error(e, &self.path.display().to_string()))?;
        let mut writer = BufWriter::new(file);
        write_pcm16_header(&mut writer, self.sample_rate, 0)?;
        debug!(path = %self.path.display(), "Recording playback");
        self.writer = Some(writer);
        Ok(())
    }

    /// Mix and write the timeline up to sample index `until`.
    fn write_until(&mut self, until: usize) -> Result<(), DeviceError> {
        self.open_writer()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(DeviceError::Closed);
        };

        while self.written < until {
            let start = self.written;
            let end = (start + RENDER_WINDOW).min(until);
            let mut window = vec![0.0f32; end - start];
            for source in &self.sources {
                let from = source.offset.max(start);
                let to = source.end().min(end);
                for t in from..to {
                    window[t - start] += source.samples[t - source.offset];
                }
            }
            for sample in window {
                writer.write_i16::<LittleEndian>(float_to_pcm(sample))?;
            }
            self.written = end;
        }

        let written = self.written;
        self.sources.retain(|source| source.end() > written);
        Ok(())
    }
}

impl OutputContext for WavRecorderOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&mut self, samples: Vec<f32>, sample_rate: u32, start_at: f64) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        self.write_until(self.settled())?;

        let samples = resample(&samples, sample_rate, self.sample_rate)
            .map_err(|e| DeviceError::Format(e.to_string()))?;
        let offset = (start_at.max(0.0) * self.sample_rate as f64).round() as usize;
        self.sources.push(ScheduledSource { offset, samples });
        Ok(())
    }

    fn stop_all(&mut self) {
        let now = self.settled();
        // Sources not yet started are forgotten, the one playing is cut at `now`.
        self.sources.retain(|s| s.offset < now);
        for source in &mut self.sources {
            source.samples.truncate(now - source.offset);
        }
        if let Err(e) = self.write_until(now) {
            warn!("Failed to write playback recording: {}", e);
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let end = self.sources.iter().map(ScheduledSource::end).max().unwrap_or(0).max(self.written);
        self.write_until(end)?;
        self.sources.clear();

        let data_len = u32::try_from(self.written * 2)
            .map_err(|_| DeviceError::Format("recording too long for a WAV file".into()))?;
        if let Some(mut writer) = self.writer.take() {
            writer.seek(SeekFrom::Start(0))?;
            write_pcm16_header(&mut writer, self.sample_rate, data_len)?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        info!(
            path = %self.path.display(),
            seconds = self.written as f64 / self.sample_rate as f64,
            "Wrote playback recording"
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for WavRecorderOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to write playback recording: {}", e);
        }
    }
}

/// Output that only keeps time.
#[derive(Debug)]
pub struct NullOutput {
    sample_rate: u32,
    clock: OutputClock,
    closed: bool,
}

impl NullOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, clock: OutputClock::new(), closed: false }
    }
}

impl OutputContext for NullOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&mut self, _samples: Vec<f32>, _sample_rate: u32, _start_at: f64) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }

    fn stop_all(&mut self) {}

    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_silent_input_produces_fixed_size_blocks() {
        let mut mic = SilentInput::new(16000);
        let mut stream = mic.acquire(1600).unwrap();
        assert!(mic.is_acquired());
        assert_eq!(stream.sample_rate, 16000);

        for _ in 0..3 {
            let block = stream.blocks.recv().await.unwrap();
            assert_eq!(block.len(), 1600);
            assert!(block.iter().all(|&s| s == 0.0));
        }

        mic.release();
        mic.release();
        assert!(!mic.is_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wav_input_streams_file_then_silence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let tone: Vec<f32> = vec![0.5; 150];
        write_wav_mono(&path, &tone, 8000).unwrap();

        let mut mic = WavFileInput::new(&path);
        let mut stream = mic.acquire(100).unwrap();
        assert_eq!(stream.sample_rate, 8000);

        let first = stream.blocks.recv().await.unwrap();
        assert!(first.iter().all(|&s| (s - 0.5).abs() < 1e-3));
        let second = stream.blocks.recv().await.unwrap();
        assert!((second[0] - 0.5).abs() < 1e-3);
        assert_eq!(second[99], 0.0); // padded tail
        let third = stream.blocks.recv().await.unwrap();
        assert!(third.iter().all(|&s| s == 0.0));

        // A second acquire while in use is refused
        assert!(mic.acquire(100).is_err());
        mic.release();
    }

    #[test]
    fn test_missing_wav_is_unavailable() {
        let err = read_wav_mono(Path::new("/definitely/not/here.wav")).unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_truncates_on_stop_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut out = WavRecorderOutput::new(&path, 1000);

        out.schedule(vec![0.25; 1000], 1000, 0.0).unwrap(); // 0s..1s
        out.schedule(vec![0.25; 1000], 1000, 1.0).unwrap(); // 1s..2s

        tokio::time::advance(Duration::from_millis(500)).await;
        out.stop_all();
        out.close().unwrap();
        assert!(out.is_closed());
        assert!(matches!(out.schedule(vec![0.1], 1000, 3.0), Err(DeviceError::Closed)));

        let (samples, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 1000);
        assert_eq!(samples.len(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_writes_settled_audio_as_it_goes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut out = WavRecorderOutput::new(&path, 1000);

        out.schedule(vec![0.25; 100], 1000, 0.0).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        out.schedule(vec![-0.25; 100], 1000, 1.0).unwrap();

        // The first chunk and the silence after it are already on disk
        assert_eq!(out.written, 1000);
        assert_eq!(out.sources.len(), 1);

        out.close().unwrap();
        let (samples, _) = read_wav_mono(&path).unwrap();
        assert_eq!(samples.len(), 1100);
        assert!((samples[50] - 0.25).abs() < 1e-3);
        assert_eq!(samples[500], 0.0);
        assert!((samples[1050] + 0.25).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_output_keeps_time() {
        let mut out = NullOutput::new(24000);
        assert_eq!(out.current_time(), 0.0);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!((out.current_time() - 0.25).abs() < 1e-9);
        out.close().unwrap();
        assert!(out.schedule(vec![0.0], 24000, 0.0).is_err());
    }
}
