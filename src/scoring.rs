//! Scoring gateway: the boundary to the external grading service.
//!
//! Gateways are single-shot and never retry; re-submitting is a learner action.
//! Every failure is returned as a `ScoringError` value.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::audio::EncodedAudio;
use crate::domain::{Classification, Feedback, Task};
use crate::error::ScoringError;
use crate::util::normalize_sentence;

#[async_trait]
pub trait ScoringGateway: Send + Sync {
  async fn score_text(&self, task: &Task, answer: &str) -> Result<Feedback, ScoringError>;
  async fn score_pronunciation(&self, task: &Task, audio: &EncodedAudio) -> Result<Feedback, ScoringError>;
}

/// Request body sent to the grading service.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScoreRequest {
  #[serde(rename_all = "camelCase")]
  Text {
    task_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_text: Option<String>,
    answer_text: String,
  },
  #[serde(rename_all = "camelCase")]
  Audio {
    task_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_text: Option<String>,
    /// Base64 of the whole encoded clip.
    audio_bytes: String,
    audio_mime_type: String,
  },
}

impl ScoreRequest {
  pub fn text(task: &Task, answer: &str) -> Self {
    ScoreRequest::Text {
      task_prompt: task.prompt.clone(),
      target_text: task.target_text.clone(),
      answer_text: answer.to_string(),
    }
  }

  pub fn audio(task: &Task, audio: &EncodedAudio) -> Self {
    ScoreRequest::Audio {
      task_prompt: task.prompt.clone(),
      target_text: task.target_text.clone(),
      audio_bytes: base64::engine::general_purpose::STANDARD.encode(&audio.bytes),
      audio_mime_type: audio.mime_type.clone(),
    }
  }

  /// Same request without the audio payload, for prompts and logs.
  pub fn metadata_json(&self) -> String {
    let value = match self {
      ScoreRequest::Audio { task_prompt, target_text, audio_bytes, audio_mime_type } => serde_json::json!({
        "taskPrompt": task_prompt,
        "targetText": target_text,
        "audioMimeType": audio_mime_type,
        "audioBytesLength": audio_bytes.len(),
      }),
      other => serde_json::to_value(other).unwrap_or_default(),
    };
    value.to_string()
  }
}

/// Response body as the service sends it. Everything optional so that
/// validation, not deserialization, decides what is malformed.
#[derive(Debug, Deserialize)]
struct FeedbackWire {
  #[serde(default)]
  classification: Option<String>,
  #[serde(default)]
  score: Option<serde_json::Number>,
  #[serde(default)]
  explanation: Option<String>,
  #[serde(default)]
  correction: Option<String>,
  #[serde(default, rename = "naturalAlternative", alias = "natural_alternative")]
  natural_alternative: Option<String>,
}

/// Interpret a raw service response as `Feedback`.
///
/// Missing `classification` or `score`, an unknown classification, a
/// non-integer score or a score outside 0..=100 is a `MalformedResponse`.
pub fn parse_feedback(raw: &str) -> Result<Feedback, ScoringError> {
  let wire: FeedbackWire = serde_json::from_str(raw.trim())
    .map_err(|e| ScoringError::MalformedResponse(format!("not a JSON object: {e}")))?;

  let label = wire
    .classification
    .ok_or_else(|| ScoringError::MalformedResponse("missing classification".into()))?;
  let classification = Classification::parse(&label)
    .ok_or_else(|| ScoringError::MalformedResponse(format!("unknown classification '{label}'")))?;

  let number = wire
    .score
    .ok_or_else(|| ScoringError::MalformedResponse("missing score".into()))?;
  let score = integral_score(&number)
    .ok_or_else(|| ScoringError::MalformedResponse(format!("score {number} is not an integer in 0..=100")))?;

  Ok(Feedback {
    classification,
    score,
    explanation: wire.explanation.unwrap_or_default(),
    correction: wire.correction.unwrap_or_default(),
    natural_alternative: wire.natural_alternative.filter(|s| !s.trim().is_empty()),
  })
}

fn integral_score(n: &serde_json::Number) -> Option<u8> {
  let value = if let Some(i) = n.as_i64() {
    i
  } else {
    let f = n.as_f64()?;
    if f.fract() != 0.0 {
      return None;
    }
    f as i64
  };
  if (0..=100).contains(&value) {
    u8::try_from(value).ok()
  } else {
    None
  }
}

/// Local grader used when no remote service is configured.
/// Text answers are compared with the reference; audio cannot be graded.
#[derive(Clone, Debug, Default)]
pub struct OfflineScoring;

#[async_trait]
impl ScoringGateway for OfflineScoring {
  #[instrument(level = "info", skip(self, task, answer), fields(task_id = %task.id, answer_len = answer.len()))]
  async fn score_text(&self, task: &Task, answer: &str) -> Result<Feedback, ScoringError> {
    let Some(target) = task.target_text.as_deref() else {
      return Err(ScoringError::ServiceUnavailable("no reference answer available for offline grading".into()));
    };
    let expected = normalize_sentence(target);
    let given = normalize_sentence(answer);
    debug!(target: "scoring", task_id = %task.id, "Offline comparison against reference");

    if given == expected {
      Ok(Feedback::perfect(target, "(local) Matches the reference answer."))
    } else if !expected.is_empty() && given.contains(&expected) {
      Ok(Feedback {
        classification: Classification::Improvable,
        score: 70,
        explanation: "(local) Contains the expected answer with extra words.".into(),
        correction: target.to_string(),
        natural_alternative: None,
      })
    } else {
      Ok(Feedback::incorrect("(local) Does not match the reference answer.", target))
    }
  }

  async fn score_pronunciation(&self, _task: &Task, _audio: &EncodedAudio) -> Result<Feedback, ScoringError> {
    Err(ScoringError::ServiceUnavailable("pronunciation scoring requires the remote grading service".into()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Skill, TaskKind};

  fn writing(target: Option<&str>) -> Task {
    Task {
      id: "t1".into(),
      kind: TaskKind::Writing,
      prompt: "Say hello formally".into(),
      target_text: target.map(str::to_string),
      xp_reward: 10,
      skill_impact: Skill::Writing,
    }
  }

  #[test]
  fn well_formed_response_parses() {
    let fb = parse_feedback(
      r#"{"classification":"IMPROVABLE","score":72,"explanation":"ok","correction":"Good morning","naturalAlternative":"Morning!"}"#,
    )
    .unwrap();
    assert_eq!(fb.classification, Classification::Improvable);
    assert_eq!(fb.score, 72);
    assert_eq!(fb.natural_alternative.as_deref(), Some("Morning!"));
  }

  #[test]
  fn integral_float_scores_are_accepted() {
    let fb = parse_feedback(r#"{"classification":"perfect","score":100.0}"#).unwrap();
    assert_eq!(fb.score, 100);
    assert_eq!(fb.explanation, "");
  }

  #[test]
  fn malformed_responses_are_rejected() {
    let cases = [
      r#"{"score": 50}"#,
      r#"{"classification": "PERFECT"}"#,
      r#"{"classification": "GREAT", "score": 50}"#,
      r#"{"classification": "PERFECT", "score": 101}"#,
      r#"{"classification": "PERFECT", "score": -1}"#,
      r#"{"classification": "PERFECT", "score": 55.5}"#,
      r#"[1, 2]"#,
      "System busy.",
    ];
    for raw in cases {
      assert!(matches!(parse_feedback(raw), Err(ScoringError::MalformedResponse(_))), "accepted: {raw}");
    }
  }

  #[test]
  fn wire_request_uses_camel_case_fields() {
    let task = writing(Some("Good morning"));
    let json = serde_json::to_value(ScoreRequest::text(&task, "Good morning!")).unwrap();
    assert_eq!(json["taskPrompt"], "Say hello formally");
    assert_eq!(json["answerText"], "Good morning!");

    let audio = EncodedAudio::from_upload(vec![1, 2, 3], "audio/webm");
    let req = ScoreRequest::audio(&task, &audio);
    let json = serde_json::to_value(&req).unwrap();
    assert_eq!(json["audioBytes"], "AQID");
    assert_eq!(json["audioMimeType"], "audio/webm");
    assert!(!req.metadata_json().contains("AQID"));
  }

  #[tokio::test]
  async fn offline_scoring_matches_reference() {
    let gw = OfflineScoring;
    let task = writing(Some("Good morning"));
    assert_eq!(gw.score_text(&task, "good morning.").await.unwrap().score, 100);
    assert_eq!(gw.score_text(&task, "Well, good morning sir").await.unwrap().classification, Classification::Improvable);
    assert_eq!(gw.score_text(&task, "Hey").await.unwrap().score, 0);
    assert!(gw.score_text(&writing(None), "Hey").await.is_err());
    let audio = EncodedAudio::from_upload(vec![0], "audio/wav");
    assert!(matches!(gw.score_pronunciation(&task, &audio).await, Err(ScoringError::ServiceUnavailable(_))));
  }
}
