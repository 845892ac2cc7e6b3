//! Hand-written fakes for the engine's ports, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::source::{InputStream, Microphone};
use crate::audio::EncodedAudio;
use crate::domain::{Feedback, Task};
use crate::error::{CaptureError, ScoringError};
use crate::scoring::ScoringGateway;

type Script = Arc<dyn Fn(usize) -> f32 + Send + Sync>;

#[derive(Clone, Default)]
pub struct MicCounters {
  reads: Arc<AtomicUsize>,
  acquired: Arc<AtomicUsize>,
  open: Arc<AtomicUsize>,
}

impl MicCounters {
  pub fn reads(&self) -> usize {
    self.reads.load(Ordering::SeqCst)
  }

  pub fn acquired(&self) -> usize {
    self.acquired.load(Ordering::SeqCst)
  }

  pub fn open_streams(&self) -> usize {
    self.open.load(Ordering::SeqCst)
  }

  /// At least one stream was opened and none is still open.
  pub fn released(&self) -> bool {
    self.acquired() > 0 && self.open_streams() == 0
  }
}

/// Microphone producing a synthetic amplitude sequence, indexed by reading number.
pub struct ScriptedMicrophone {
  granted: bool,
  script: Script,
  counters: MicCounters,
}

impl ScriptedMicrophone {
  pub fn granted(script: impl Fn(usize) -> f32 + Send + Sync + 'static) -> Self {
    Self { granted: true, script: Arc::new(script), counters: MicCounters::default() }
  }

  pub fn denied() -> Self {
    Self { granted: false, script: Arc::new(|_| 0.0), counters: MicCounters::default() }
  }

  pub fn counters(&self) -> MicCounters {
    self.counters.clone()
  }
}

#[async_trait]
impl Microphone for ScriptedMicrophone {
  async fn acquire(&self) -> Result<Box<dyn InputStream>, CaptureError> {
    if !self.granted {
      return Err(CaptureError::PermissionDenied);
    }
    self.counters.acquired.fetch_add(1, Ordering::SeqCst);
    self.counters.open.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(ScriptedStream { script: self.script.clone(), counters: self.counters.clone(), last: 0.0 }))
  }
}

struct ScriptedStream {
  script: Script,
  counters: MicCounters,
  last: f32,
}

impl InputStream for ScriptedStream {
  fn sample_rate(&self) -> u32 {
    16_000
  }

  fn amplitude(&mut self) -> f32 {
    let n = self.counters.reads.fetch_add(1, Ordering::SeqCst);
    self.last = (self.script)(n);
    self.last
  }

  /// 50ms worth of samples at the last amplitude.
  fn drain(&mut self) -> Vec<i16> {
    vec![(self.last * i16::MAX as f32) as i16; 800]
  }
}

impl Drop for ScriptedStream {
  fn drop(&mut self) {
    self.counters.open.fetch_sub(1, Ordering::SeqCst);
  }
}

/// One scripted gateway reply.
#[derive(Clone, Debug)]
pub enum Reply {
  Score(u8),
  Fail(ScoringError),
  /// Never answers; exercises the scoring timeout.
  Hang,
}

/// Gateway returning queued replies in order; the last reply repeats.
#[derive(Clone)]
pub struct ScriptedGateway {
  replies: Arc<Mutex<VecDeque<Reply>>>,
  pub text_calls: Arc<AtomicUsize>,
  pub audio_calls: Arc<AtomicUsize>,
}

impl ScriptedGateway {
  pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
    Self {
      replies: Arc::new(Mutex::new(replies.into_iter().collect())),
      text_calls: Arc::default(),
      audio_calls: Arc::default(),
    }
  }

  pub fn calls(&self) -> usize {
    self.text_calls.load(Ordering::SeqCst) + self.audio_calls.load(Ordering::SeqCst)
  }

  fn next_reply(&self) -> Reply {
    let mut q = self.replies.lock().unwrap();
    if q.len() > 1 {
      q.pop_front().unwrap()
    } else {
      q.front().cloned().unwrap_or(Reply::Score(100))
    }
  }

  async fn answer(&self) -> Result<Feedback, ScoringError> {
    match self.next_reply() {
      Reply::Score(score) => {
        let mut fb = Feedback::perfect("", "scripted");
        fb.score = score;
        Ok(fb)
      }
      Reply::Fail(e) => Err(e),
      Reply::Hang => {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ScoringError::ServiceUnavailable("hung".into()))
      }
    }
  }
}

#[async_trait]
impl ScoringGateway for ScriptedGateway {
  async fn score_text(&self, _task: &Task, _answer: &str) -> Result<Feedback, ScoringError> {
    self.text_calls.fetch_add(1, Ordering::SeqCst);
    self.answer().await
  }

  async fn score_pronunciation(&self, _task: &Task, _audio: &EncodedAudio) -> Result<Feedback, ScoringError> {
    self.audio_calls.fetch_add(1, Ordering::SeqCst);
    self.answer().await
  }
}
