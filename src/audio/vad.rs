//! Amplitude-threshold voice activity detection.
//!
//! Silence is a *contiguous* run of readings below the threshold. Any reading at
//! or above the threshold resets the run, so brief noise restarts the timer.

use std::time::Duration;

use tokio::time::Instant;

/// Normalized RMS of a block of 16-bit PCM, in 0.0..=1.0.
pub fn rms(samples: &[i16]) -> f32 {
  if samples.is_empty() {
    return 0.0;
  }
  let sum: f64 = samples
    .iter()
    .map(|&s| {
      let v = s as f64 / i16::MAX as f64;
      v * v
    })
    .sum();
  ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

#[derive(Clone, Debug)]
pub struct SilenceDetector {
  threshold: f32,
  duration: Duration,
  run_start: Option<Instant>,
}

impl SilenceDetector {
  pub fn new(threshold: f32, duration: Duration) -> Self {
    Self { threshold, duration, run_start: None }
  }

  /// Feed one reading taken at `now`. Returns true once the current silent run
  /// has lasted at least the configured duration.
  pub fn observe(&mut self, amplitude: f32, now: Instant) -> bool {
    if amplitude >= self.threshold {
      self.run_start = None;
      return false;
    }
    let start = *self.run_start.get_or_insert(now);
    now.duration_since(start) >= self.duration
  }

  pub fn silence_run_start(&self) -> Option<Instant> {
    self.run_start
  }
}
