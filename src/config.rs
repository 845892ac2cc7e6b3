//! Loading lesson engine configuration (prompts, tuning constants, extra lessons) from TOML.
//!
//! See `LessonConfig`, `Prompts`, `EngineSettings` and `CaptureSettings` for expected schema.
//! Every section is optional; anything missing falls back to the defaults below.

use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::Task;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LessonConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub engine: EngineSettings,
  #[serde(default)]
  pub capture: CaptureSettings,
  #[serde(default)]
  pub lessons: Vec<LessonCfg>,
}

/// Lesson entry accepted in TOML configuration. Task order in the file is presentation order.
#[derive(Clone, Debug, Deserialize)]
pub struct LessonCfg {
  pub id: String,
  #[serde(default)]
  pub tasks: Vec<Task>,
}

/// Prompts used by the remote scoring gateway.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub text_eval_system: String,
  pub text_eval_user_template: String,
  pub pronunciation_system: String,
  pub pronunciation_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      text_eval_system: "You are a world-class English teacher grading a learner's answer. Respond ONLY with strict JSON.".into(),
      text_eval_user_template: "Evaluate the submission below.\n{submission_json}\n\nClassification rules:\n- PERFECT: 100% correct, natural and idiomatic.\n- IMPROVABLE: grammatically correct but there is a more fluent or common way.\n- UNNATURAL: understandable but sounds like a literal translation.\n- INCORRECT: grammar or vocabulary errors that hinder clarity.\n\nReturn JSON: {\"classification\": \"PERFECT|IMPROVABLE|UNNATURAL|INCORRECT\", \"score\": integer 0-100, \"explanation\": string, \"correction\": string, \"naturalAlternative\": string}".into(),
      pronunciation_system: "You are an English pronunciation coach. Listen to the attached recording. Respond ONLY with strict JSON.".into(),
      pronunciation_user_template: "Evaluate pronunciation of the expected text: \"{target_text}\".\nSubmission metadata:\n{submission_json}\n\nReturn JSON: {\"classification\": \"PERFECT|IMPROVABLE|UNNATURAL|INCORRECT\", \"score\": integer 0-100, \"explanation\": string, \"correction\": string}".into(),
    }
  }
}

/// Pass/fail policy and bookkeeping constants for lesson sessions.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
  /// Minimum score (inclusive) treated as a pass.
  pub pass_threshold: u8,
  /// Percentage points added to each skill touched by a passed task.
  pub skill_step: u8,
  /// Upper bound for one scoring call, in seconds.
  pub scoring_timeout_secs: u64,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self { pass_threshold: 60, skill_step: 5, scoring_timeout_secs: 20 }
  }
}

impl EngineSettings {
  pub fn scoring_timeout(&self) -> Duration {
    Duration::from_secs(self.scoring_timeout_secs)
  }
}

/// Sampling and silence detection constants for the capture engine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
  pub sample_interval_ms: u64,
  /// Normalized RMS amplitude (0.0..=1.0) below which input counts as silence.
  pub silence_threshold: f32,
  /// Continuous silence that triggers the automatic stop.
  pub silence_duration_ms: u64,
  /// Number of amplitude readings kept for the live silence test.
  pub amplitude_window: usize,
}

impl Default for CaptureSettings {
  fn default() -> Self {
    Self {
      sample_interval_ms: 50,
      silence_threshold: 0.02,
      silence_duration_ms: 2500,
      amplitude_window: 64,
    }
  }
}

impl CaptureSettings {
  pub fn sample_interval(&self) -> Duration {
    Duration::from_millis(self.sample_interval_ms.max(1))
  }

  pub fn silence_duration(&self) -> Duration {
    Duration::from_millis(self.silence_duration_ms)
  }
}

/// Attempt to load `LessonConfig` from LESSON_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_lesson_config_from_env() -> Option<LessonConfig> {
  let path = std::env::var("LESSON_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_lesson_config(&s) {
      Ok(cfg) => {
        info!(target: "lingualeap_backend", %path, lessons = cfg.lessons.len(), "Loaded lesson config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "lingualeap_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "lingualeap_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

pub fn parse_lesson_config(s: &str) -> Result<LessonConfig, toml::de::Error> {
  toml::from_str::<LessonConfig>(s)
}
