//! # Audio Pipeline
//!
//! Everything between the devices and the wire.
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz by default in both directions (configurable)
//! - **Bit Depth**: 16-bit PCM on the wire, `f32` in [-1, 1] in memory
//! - **Channels**: Mono
//! - **Encoding**: little-endian signed integers, base64 inside JSON frames

pub mod capture;   // Microphone → fixed-size outbound frames
pub mod codec;     // f32 ⇄ PCM16 ⇄ base64, resampling
pub mod playback;  // Gapless scheduling of inbound chunks
