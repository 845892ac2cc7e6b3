//! One-at-a-time audio capture with amplitude-based auto-stop.
//!
//! A capture owns its input stream from `start_capture` until the sampling loop
//! ends (manual stop, sustained silence, or teardown). The stream is dropped,
//! and with it the device released, inside the loop task, so an aborted loop
//! releases it as well.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::audio::encode::{encode_wav, EncodedAudio};
use crate::audio::source::{InputStream, Microphone};
use crate::audio::vad::SilenceDetector;
use crate::config::CaptureSettings;
use crate::error::CaptureError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CaptureHandle(Uuid);

impl fmt::Display for CaptureHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
  Manual,
  Silence,
}

/// Live view of a running capture, for level meters and the recording timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CaptureProgress {
  pub elapsed_ticks: u64,
  pub elapsed_ms: u64,
  /// Peak of the recent amplitude window.
  pub level: f32,
  pub silent_for_ms: u64,
}

/// Result of a finished capture.
#[derive(Clone, Debug)]
pub struct CapturedClip {
  pub audio: EncodedAudio,
  pub stop_reason: StopReason,
  pub elapsed_ticks: u64,
}

struct Recording {
  pcm: Vec<i16>,
  sample_rate: u32,
  elapsed_ticks: u64,
  stop_reason: StopReason,
}

struct ActiveCapture {
  handle: CaptureHandle,
  stop_tx: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<Recording>>,
  abort: AbortHandle,
  progress: watch::Receiver<CaptureProgress>,
}

enum Slot {
  Idle,
  Acquiring(CaptureHandle),
  Active(ActiveCapture),
}

pub struct AudioCaptureEngine {
  microphone: Arc<dyn Microphone>,
  settings: CaptureSettings,
  slot: Mutex<Slot>,
}

impl AudioCaptureEngine {
  pub fn new(microphone: Arc<dyn Microphone>, settings: CaptureSettings) -> Self {
    Self { microphone, settings, slot: Mutex::new(Slot::Idle) }
  }

  fn lock_slot(&self) -> MutexGuard<'_, Slot> {
    self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// True from `start_capture` until the capture is collected or torn down.
  pub fn is_active(&self) -> bool {
    !matches!(*self.lock_slot(), Slot::Idle)
  }

  pub fn progress(&self) -> Option<CaptureProgress> {
    match &*self.lock_slot() {
      Slot::Active(active) => Some(*active.progress.borrow()),
      _ => None,
    }
  }

  /// Request the microphone and start the sampling loop.
  ///
  /// Rejected while another capture is active. When access is denied nothing
  /// is kept, so there is nothing to clean up.
  #[instrument(level = "info", skip(self))]
  pub async fn start_capture(&self) -> Result<CaptureHandle, CaptureError> {
    let handle = CaptureHandle(Uuid::new_v4());
    {
      let mut slot = self.lock_slot();
      if !matches!(*slot, Slot::Idle) {
        warn!(target: "capture", "Capture start rejected: another capture is active");
        return Err(CaptureError::AlreadyActive);
      }
      *slot = Slot::Acquiring(handle);
    }

    let acquired = self.microphone.acquire().await;

    let mut slot = self.lock_slot();
    let still_ours = matches!(*slot, Slot::Acquiring(h) if h == handle);
    let stream = match acquired {
      Ok(stream) => stream,
      Err(e) => {
        if still_ours {
          *slot = Slot::Idle;
        }
        warn!(target: "capture", error = %e, "Microphone acquisition failed");
        return Err(e);
      }
    };
    if !still_ours {
      // Torn down while waiting for access; the stream is dropped right here.
      return Err(CaptureError::Cancelled);
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let (progress_tx, progress_rx) = watch::channel(CaptureProgress::default());
    let task = tokio::spawn(sampling_loop(stream, self.settings.clone(), stop_rx, progress_tx));
    *slot = Slot::Active(ActiveCapture {
      handle,
      stop_tx: Some(stop_tx),
      abort: task.abort_handle(),
      task: Some(task),
      progress: progress_rx,
    });
    info!(target: "capture", %handle, interval_ms = self.settings.sample_interval_ms, "Capture started");
    Ok(handle)
  }

  /// Manual stop. Idempotent: stopping a capture whose loop already ended is fine.
  #[instrument(level = "info", skip(self))]
  pub fn stop_capture(&self, handle: CaptureHandle) -> Result<(), CaptureError> {
    let mut slot = self.lock_slot();
    match &mut *slot {
      Slot::Active(active) if active.handle == handle => {
        if let Some(tx) = active.stop_tx.take() {
          let _ = tx.send(());
          info!(target: "capture", %handle, "Capture stop requested");
        }
        Ok(())
      }
      _ => Err(CaptureError::UnknownHandle),
    }
  }

  /// Wait for the sampling loop to end (manual or automatic stop) and package
  /// everything recorded into one blob. Frees the slot for the next capture.
  #[instrument(level = "info", skip(self))]
  pub async fn on_capture_complete(&self, handle: CaptureHandle) -> Result<CapturedClip, CaptureError> {
    let task = {
      let mut slot = self.lock_slot();
      match &mut *slot {
        Slot::Active(active) if active.handle == handle => active.task.take().ok_or(CaptureError::UnknownHandle)?,
        _ => return Err(CaptureError::UnknownHandle),
      }
    };

    let joined = task.await;
    {
      let mut slot = self.lock_slot();
      if matches!(&*slot, Slot::Active(active) if active.handle == handle) {
        *slot = Slot::Idle;
      }
    }
    let recording = joined.map_err(|_| CaptureError::Cancelled)?;

    let Recording { pcm, sample_rate, elapsed_ticks, stop_reason } = recording;
    info!(target: "capture", %handle, ?stop_reason, elapsed_ticks, samples = pcm.len(), "Capture finished; packaging audio");
    let audio = tokio::task::spawn_blocking(move || encode_wav(&pcm, sample_rate))
      .await
      .map_err(|e| CaptureError::Encoding(e.to_string()))??;

    Ok(CapturedClip { audio, stop_reason, elapsed_ticks })
  }

  /// Cancel whatever is in progress and release the stream, regardless of state.
  pub fn teardown(&self) {
    let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Idle);
    match previous {
      Slot::Active(active) => {
        active.abort.abort();
        info!(target: "capture", handle = %active.handle, "Capture torn down");
      }
      Slot::Acquiring(handle) => debug!(target: "capture", %handle, "Capture torn down during acquisition"),
      Slot::Idle => {}
    }
  }
}

impl Drop for AudioCaptureEngine {
  fn drop(&mut self) {
    self.teardown();
  }
}

async fn sampling_loop(
  mut stream: Box<dyn InputStream>,
  settings: CaptureSettings,
  mut stop_rx: oneshot::Receiver<()>,
  progress_tx: watch::Sender<CaptureProgress>,
) -> Recording {
  let interval = settings.sample_interval();
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  let window_len = settings.amplitude_window.max(1);
  let mut window: VecDeque<f32> = VecDeque::with_capacity(window_len);
  let mut detector = SilenceDetector::new(settings.silence_threshold, settings.silence_duration());
  let mut pcm: Vec<i16> = Vec::new();
  let mut elapsed_ticks: u64 = 0;

  let stop_reason = loop {
    tokio::select! {
      biased;
      _ = &mut stop_rx => break StopReason::Manual,
      _ = ticker.tick() => {
        let now = Instant::now();
        let amplitude = stream.amplitude();
        pcm.extend(stream.drain());
        elapsed_ticks += 1;

        if window.len() == window_len {
          window.pop_front();
        }
        window.push_back(amplitude);

        let silent = detector.observe(amplitude, now);
        progress_tx.send_replace(CaptureProgress {
          elapsed_ticks,
          elapsed_ms: elapsed_ticks.saturating_mul(interval.as_millis() as u64),
          level: window.iter().copied().fold(0.0, f32::max),
          silent_for_ms: detector
            .silence_run_start()
            .map(|start| now.duration_since(start).as_millis() as u64)
            .unwrap_or(0),
        });
        if silent {
          debug!(target: "capture", elapsed_ticks, "Sustained silence; stopping automatically");
          break StopReason::Silence;
        }
      }
    }
  };

  if stop_reason == StopReason::Manual {
    // Keep whatever arrived between the last tick and the stop request.
    pcm.extend(stream.drain());
  }
  let sample_rate = stream.sample_rate();
  drop(stream);

  Recording { pcm, sample_rate, elapsed_ticks, stop_reason }
}
