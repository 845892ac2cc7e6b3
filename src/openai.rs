//! Minimal OpenAI client used as the remote scoring gateway.
//!
//! We only call chat.completions in JSON-object mode. Text answers go in the user
//! message; recordings are attached as an `input_audio` content part.
//! Calls are instrumented and log model names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key or audio payloads.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::audio::EncodedAudio;
use crate::config::Prompts;
use crate::domain::{Feedback, Task};
use crate::error::ScoringError;
use crate::scoring::{parse_feedback, ScoreRequest, ScoringGateway};
use crate::util::{fill_template, trunc_for_log};

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub scoring_model: String,
  pub audio_model: String,
  pub prompts: Prompts,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(prompts: Prompts, timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let scoring_model =
      std::env::var("OPENAI_SCORING_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let audio_model =
      std::env::var("OPENAI_AUDIO_MODEL").unwrap_or_else(|_| "gpt-4o-audio-preview".into());
    Self::new(api_key, base_url, scoring_model, audio_model, prompts, timeout)
  }

  /// Build the HTTP client; a failure is logged and leaves scoring offline.
  pub fn new(
    api_key: String,
    base_url: String,
    scoring_model: String,
    audio_model: String,
    prompts: Prompts,
    timeout: Duration,
  ) -> Option<Self> {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
      Ok(client) => client,
      Err(e) => {
        error!(target: "scoring", error = %e, "Failed to build OpenAI HTTP client");
        return None;
      }
    };

    Some(Self { client, api_key, base_url, scoring_model, audio_model, prompts })
  }

  /// JSON-object chat completion; returns the raw message content.
  #[instrument(level = "info", skip(self, system, user), fields(model = %model, parts = user.len()))]
  async fn chat_json_raw(&self, model: &str, system: &str, user: Vec<ContentPart>) -> Result<String, ScoringError> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: vec![ContentPart::Text { text: system.into() }] },
        ChatMessageReq { role: "user".into(), content: user },
      ],
      temperature: 0.2,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
    };

    let start = Instant::now();
    let res = self.client.post(&url)
      .header(USER_AGENT, "lingualeap-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await
      .map_err(|e| ScoringError::ServiceUnavailable(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or_else(|| trunc_for_log(&body, 200));
      error!(target: "scoring", %status, elapsed = ?start.elapsed(), "OpenAI returned an error status");
      return Err(ScoringError::ServiceUnavailable(format!("OpenAI HTTP {}: {}", status, msg)));
    }

    let body: ChatCompletionResponse = res
      .json()
      .await
      .map_err(|e| ScoringError::MalformedResponse(format!("unreadable completion envelope: {e}")))?;
    if let Some(usage) = &body.usage {
      info!(target: "scoring", prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default();
    info!(target: "scoring", elapsed = ?start.elapsed(), response_len = text.len(), "Model response received");
    Ok(text)
  }
}

#[async_trait]
impl ScoringGateway for OpenAI {
  #[instrument(level = "info", skip(self, task, answer), fields(task_id = %task.id, answer_len = answer.len(), model = %self.scoring_model))]
  async fn score_text(&self, task: &Task, answer: &str) -> Result<Feedback, ScoringError> {
    let request = ScoreRequest::text(task, answer);
    let submission = serde_json::to_string(&request)
      .map_err(|e| ScoringError::ServiceUnavailable(format!("could not encode request: {e}")))?;
    let user = fill_template(&self.prompts.text_eval_user_template, &[("submission_json", &submission)]);

    let raw = self
      .chat_json_raw(&self.scoring_model, &self.prompts.text_eval_system, vec![ContentPart::Text { text: user }])
      .await?;
    parse_feedback(&raw)
  }

  #[instrument(level = "info", skip(self, task, audio), fields(task_id = %task.id, audio_len = audio.bytes.len(), duration_ms = audio.duration.as_millis() as u64, mime = %audio.mime_type, model = %self.audio_model))]
  async fn score_pronunciation(&self, task: &Task, audio: &EncodedAudio) -> Result<Feedback, ScoringError> {
    let request = ScoreRequest::audio(task, audio);
    let ScoreRequest::Audio { audio_bytes, .. } = &request else {
      return Err(ScoringError::ServiceUnavailable("audio request expected".into()));
    };
    let user = fill_template(
      &self.prompts.pronunciation_user_template,
      &[
        ("target_text", task.target_text.as_deref().unwrap_or(&task.prompt)),
        ("submission_json", &request.metadata_json()),
      ],
    );
    let parts = vec![
      ContentPart::Text { text: user },
      ContentPart::InputAudio {
        input_audio: InputAudio { data: audio_bytes.clone(), format: audio_format(&audio.mime_type).into() },
      },
    ];

    let raw = self
      .chat_json_raw(&self.audio_model, &self.prompts.pronunciation_system, parts)
      .await?;
    parse_feedback(&raw)
  }
}

/// Map a MIME type onto the `input_audio.format` names the API accepts.
fn audio_format(mime: &str) -> &'static str {
  match mime.split(';').next().unwrap_or_default().trim() {
    "audio/mpeg" | "audio/mp3" => "mp3",
    "audio/webm" => "webm",
    "audio/ogg" => "ogg",
    _ => "wav",
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: Vec<ContentPart> }
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
  Text { text: String },
  InputAudio { input_audio: InputAudio },
}
#[derive(Serialize)]
struct InputAudio { data: String, format: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
