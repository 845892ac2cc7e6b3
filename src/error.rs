//! Error types at each component boundary.

use thiserror::Error;

/// Failures of the audio capture engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
  #[error("Microphone access denied. Please enable it in your browser or system settings.")]
  PermissionDenied,

  #[error("A recording is already in progress")]
  AlreadyActive,

  #[error("No recording matches this handle")]
  UnknownHandle,

  #[error("No audio captured")]
  NoAudioCaptured,

  #[error("The recording was cancelled")]
  Cancelled,

  #[error("Failed to package recorded audio: {0}")]
  Encoding(String),
}

/// Failures of the scoring gateway. Never escapes the session: the controller
/// turns both variants into a zero-score feedback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoringError {
  #[error("scoring service unavailable: {0}")]
  ServiceUnavailable(String),

  #[error("scoring service returned an unreadable result: {0}")]
  MalformedResponse(String),
}

/// Failures of checkpoint / user record persistence.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("store data is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),
}

/// Errors surfaced by the lesson session controller.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error("No lesson exists with id '{0}'")]
  MissingLesson(String),

  #[error("Unknown session '{0}'")]
  UnknownSession(String),

  #[error("Action '{action}' is not allowed while the session is {phase}")]
  InvalidPhase { action: &'static str, phase: &'static str },

  #[error("The current feedback is a pass; use advance")]
  AlreadyPassed,

  #[error("The current feedback is not a pass; retry or force advance")]
  NotPassed,

  #[error("Answer is empty")]
  EmptyAnswer,

  #[error("A {answer} answer cannot be submitted for a {task} task")]
  AnswerKindMismatch { answer: &'static str, task: &'static str },

  #[error("The session has been closed")]
  TornDown,

  #[error(transparent)]
  Capture(#[from] CaptureError),

  #[error(transparent)]
  Store(#[from] StoreError),
}
