//! Microphone ports and the WebSocket-fed microphone used by the server.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::audio::vad::rms;
use crate::error::CaptureError;

/// An exclusively owned, open input stream. Dropping it releases the device.
pub trait InputStream: Send {
  fn sample_rate(&self) -> u32;

  /// Current input level as normalized RMS (0.0..=1.0).
  fn amplitude(&mut self) -> f32;

  /// PCM captured since the previous call.
  fn drain(&mut self) -> Vec<i16>;
}

/// Source of input streams. `acquire` is where access is requested and may be refused.
#[async_trait]
pub trait Microphone: Send + Sync {
  async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError>;
}

#[derive(Default)]
struct FeedState {
  granted: bool,
  sample_rate: u32,
  feed: Option<mpsc::UnboundedSender<Vec<i16>>>,
}

/// Microphone whose audio arrives as PCM frames pushed by a remote client.
///
/// The client grants (or revokes) access explicitly; while a stream is open,
/// frames pushed with [`ChannelMicrophone::push_frame`] are routed to it.
#[derive(Clone, Default)]
pub struct ChannelMicrophone {
  state: Arc<Mutex<FeedState>>,
}

impl ChannelMicrophone {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock_state(&self) -> MutexGuard<'_, FeedState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn set_permission(&self, granted: bool, sample_rate: u32) {
    let mut st = self.lock_state();
    st.granted = granted;
    st.sample_rate = sample_rate;
    if !granted {
      // Revoking access closes any open stream.
      st.feed = None;
    }
  }

  /// Route one frame to the open stream. Returns false when nothing is recording.
  pub fn push_frame(&self, frame: Vec<i16>) -> bool {
    let mut st = self.lock_state();
    let delivered = match &st.feed {
      Some(tx) => tx.send(frame).is_ok(),
      None => return false,
    };
    if !delivered {
      st.feed = None;
    }
    delivered
  }
}

#[async_trait]
impl Microphone for ChannelMicrophone {
  async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError> {
    let mut st = self.lock_state();
    if !st.granted {
      warn!(target: "capture", "Microphone requested but access was not granted");
      return Err(CaptureError::PermissionDenied);
    }
    let (tx, rx) = mpsc::unbounded_channel();
    st.feed = Some(tx);
    debug!(target: "capture", sample_rate = st.sample_rate, "Channel microphone acquired");
    Ok(Box::new(ChannelStream { rx, sample_rate: st.sample_rate, pending: Vec::new() }))
  }
}

struct ChannelStream {
  rx: mpsc::UnboundedReceiver<Vec<i16>>,
  sample_rate: u32,
  pending: Vec<i16>,
}

impl InputStream for ChannelStream {
  fn sample_rate(&self) -> u32 {
    self.sample_rate
  }

  /// Level of the frames that arrived since the last reading. No frames reads as silence.
  fn amplitude(&mut self) -> f32 {
    let mut fresh = Vec::new();
    while let Ok(frame) = self.rx.try_recv() {
      fresh.extend_from_slice(&frame);
    }
    let level = rms(&fresh);
    self.pending.extend(fresh);
    level
  }

  fn drain(&mut self) -> Vec<i16> {
    while let Ok(frame) = self.rx.try_recv() {
      self.pending.extend_from_slice(&frame);
    }
    std::mem::take(&mut self.pending)
  }
}
