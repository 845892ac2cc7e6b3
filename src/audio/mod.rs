//! Audio capture: microphone port, silence detection and the sampling engine.
//!
//! # Components
//! - `source.rs`: `Microphone` / `InputStream` ports and the WebSocket-fed microphone
//! - `vad.rs`: amplitude helpers and the contiguous-silence detector
//! - `engine.rs`: `AudioCaptureEngine`, one capture at a time with auto-stop
//! - `encode.rs`: packaging buffered PCM into a single WAV blob

pub mod encode;
pub mod engine;
pub mod source;
pub mod vad;

pub use encode::EncodedAudio;
pub use engine::{AudioCaptureEngine, CaptureHandle, CaptureProgress, StopReason};
pub use source::ChannelMicrophone;
