//! # Microphone Capture
//!
//! Turns the live input device into a stream of fixed-size outbound frames.
//!
//! ## Pipeline:
//! 1. **Device**: an [`InputDevice`] produces mono float blocks at its native rate
//! 2. **Resample**: blocks are converted to the wire input rate, keeping phase across blocks
//! 3. **Assemble**: samples accumulate until a full frame (`buffer_size` samples) exists
//! 4. **Encode**: each frame becomes base64 PCM16 and is pushed to the caller's sink
//!
//! Muting flips an `AtomicBool` read by the pump task. The device keeps running
//! while muted, so un-muting takes effect on the very next frame.

use crate::audio::codec::{float_to_pcm16_base64, StreamResampler};
use crate::config::MutePolicy;
use crate::device::InputDevice;
use crate::error::{CaptureError, DeviceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One outbound microphone frame, ready for `input_audio_chunk`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Base64 PCM16 mono samples.
    pub audio: String,
    pub sample_rate: u32,
}

/// Accumulates variable-size blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self { frame_size, pending: Vec::with_capacity(frame_size * 2) }
    }

    /// Add samples and return every frame that is now complete, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Owner of the microphone for one conversation.
pub struct AudioCapture {
    device: Box<dyn InputDevice>,
    target_rate: u32,
    frame_size: usize,
    mute_policy: MutePolicy,
    muted: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl AudioCapture {
    /// Create a capture over `device` producing frames of `frame_size` samples at `target_rate`.
    pub fn new(
        device: Box<dyn InputDevice>,
        target_rate: u32,
        frame_size: usize,
        mute_policy: MutePolicy,
    ) -> Self {
        Self {
            device,
            target_rate,
            frame_size,
            mute_policy,
            muted: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// Acquire the microphone and start delivering frames to `sink`.
    ///
    /// A second call while capture is active does nothing and succeeds.
    /// Permission denial is returned as-is and leaves capture inactive.
    pub fn start(&mut self, sink: mpsc::UnboundedSender<AudioFrame>) -> Result<(), CaptureError> {
        if self.is_active() {
            debug!("Capture already active, ignoring start");
            return Ok(());
        }
        // A pump that ended on its own still holds the device
        self.stop();

        let stream = match self.device.acquire(self.frame_size) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Microphone acquisition failed: {}", e);
                return Err(e.into());
            }
        };

        let source_rate = stream.sample_rate;
        let target_rate = self.target_rate;
        let mut resampler = match StreamResampler::new(source_rate, target_rate) {
            Ok(resampler) => resampler,
            Err(e) => {
                self.device.release();
                return Err(CaptureError::Device(DeviceError::Format(e.to_string())));
            }
        };
        let muted = Arc::clone(&self.muted);
        let policy = self.mute_policy;
        let mut assembler = FrameAssembler::new(self.frame_size);
        let mut blocks = stream.blocks;

        info!(source_rate, target_rate, frame_size = self.frame_size, "Audio capture started");

        self.pump = Some(tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                let block = resampler.process(&block);
                for frame in assembler.push(&block) {
                    let audio = if muted.load(Ordering::Relaxed) {
                        match policy {
                            MutePolicy::Drop => continue,
                            MutePolicy::Silence => float_to_pcm16_base64(&vec![0.0; frame.len()]),
                        }
                    } else {
                        float_to_pcm16_base64(&frame)
                    };

                    if sink.send(AudioFrame { audio, sample_rate: target_rate }).is_err() {
                        debug!("Frame sink closed, stopping capture pump");
                        return;
                    }
                }
            }
            info!("Input device stopped producing audio, capture ended");
        }));

        Ok(())
    }

    /// Stop capturing and release the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            info!("Audio capture stopped");
        }
        self.device.release();
    }

    pub fn set_muted(&self, muted: bool) {
        let was = self.muted.swap(muted, Ordering::Relaxed);
        if was != muted {
            debug!(muted, "Capture mute changed");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// True while frames are flowing: the pump is running and the device is held.
    pub fn is_active(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished()) && self.device.is_acquired()
    }

    pub fn device_acquired(&self) -> bool {
        self.device.is_acquired()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
