//! Packaging buffered PCM into one compressed-container blob per capture.

use std::io::Cursor;
use std::time::Duration;

use crate::error::CaptureError;

pub const WAV_MIME: &str = "audio/wav";

/// A finished recording, ready to be submitted as a single blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedAudio {
  pub bytes: Vec<u8>,
  pub mime_type: String,
  pub duration: Duration,
}

impl EncodedAudio {
  /// Wrap a clip recorded elsewhere (e.g. uploaded by a client).
  pub fn from_upload(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
    Self { bytes, mime_type: mime_type.into(), duration: Duration::ZERO }
  }
}

/// 16-bit mono WAV, written in memory.
pub fn encode_wav(pcm: &[i16], sample_rate: u32) -> Result<EncodedAudio, CaptureError> {
  if pcm.is_empty() {
    return Err(CaptureError::NoAudioCaptured);
  }
  let spec = hound::WavSpec {
    channels: 1,
    sample_rate,
    bits_per_sample: 16,
    sample_format: hound::SampleFormat::Int,
  };

  let mut bytes = Vec::with_capacity(44 + pcm.len() * 2);
  {
    let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
      .map_err(|e| CaptureError::Encoding(e.to_string()))?;
    for &s in pcm {
      writer.write_sample(s).map_err(|e| CaptureError::Encoding(e.to_string()))?;
    }
    writer.finalize().map_err(|e| CaptureError::Encoding(e.to_string()))?;
  }

  let duration = Duration::from_secs_f64(pcm.len() as f64 / sample_rate.max(1) as f64);
  Ok(EncodedAudio { bytes, mime_type: WAV_MIME.into(), duration })
}
