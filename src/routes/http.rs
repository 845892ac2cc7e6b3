//! HTTP endpoint handlers. These are thin wrappers that forward to the session registry.
//! Each handler is instrumented and logs parameters and basic result info (answers by length only).

use std::sync::Arc;
use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use base64::Engine as _;
use tracing::{error, info, instrument, warn};

use crate::audio::EncodedAudio;
use crate::error::{CaptureError, SessionError};
use crate::protocol::*;
use crate::session::Answer;
use crate::state::AppState;

/// Error body returned by every endpoint: `{ "error": message }`.
#[derive(Debug)]
pub enum ApiError {
  Session(SessionError),
  BadRequest(String),
}

impl From<SessionError> for ApiError {
  fn from(e: SessionError) -> Self {
    ApiError::Session(e)
  }
}

pub fn status_for(e: &SessionError) -> StatusCode {
  match e {
    SessionError::MissingLesson(_) | SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
    SessionError::InvalidPhase { .. }
    | SessionError::AlreadyPassed
    | SessionError::NotPassed
    | SessionError::TornDown => StatusCode::CONFLICT,
    SessionError::EmptyAnswer | SessionError::AnswerKindMismatch { .. } => StatusCode::BAD_REQUEST,
    SessionError::Capture(c) => match c {
      CaptureError::PermissionDenied => StatusCode::FORBIDDEN,
      CaptureError::AlreadyActive | CaptureError::UnknownHandle | CaptureError::Cancelled => StatusCode::CONFLICT,
      CaptureError::NoAudioCaptured => StatusCode::BAD_REQUEST,
      CaptureError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
    },
    SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, message) = match self {
      ApiError::Session(e) => (status_for(&e), e.to_string()),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
    };
    if status.is_server_error() {
      error!(target: "lingualeap_backend", %status, error = %message, "Request failed");
    } else {
      warn!(target: "lingualeap_backend", %status, error = %message, "Request rejected");
    }
    (status, Json(ErrorOut { error: message })).into_response()
  }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state, body), fields(user_id = %body.user_id, lesson_id = %body.lesson_id))]
pub async fn http_start_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StartSessionIn>,
) -> ApiResult<SessionOut> {
  let (id, snapshot) = state.open_session(&body.user_id, &body.lesson_id).await?;
  info!(target: "lesson", session_id = %id, index = snapshot.current_index, "HTTP session started");
  Ok(Json(to_out(&id, snapshot)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<SessionOut> {
  let snapshot = state.snapshot(&id).await?;
  Ok(Json(to_out(&id, snapshot)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_close_session(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
  state.close_session(&id).await?;
  info!(target: "lesson", session_id = %id, "HTTP session closed");
  Ok(StatusCode::NO_CONTENT)
}

#[instrument(level = "info", skip(state, body), fields(answer_len = body.text.len()))]
pub async fn http_post_answer(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<AnswerIn>,
) -> ApiResult<SubmitOut> {
  let submitted = state.submit(&id, Answer::Text(body.text)).await?;
  info!(target: "lesson", session_id = %id, ignored = submitted.ignored, passed = ?submitted.snapshot.passed, "HTTP answer evaluated");
  Ok(Json(SubmitOut { ignored: submitted.ignored, session: to_out(&id, submitted.snapshot) }))
}

#[instrument(level = "info", skip(state, body), fields(b64_len = body.audio_base64.len(), mime = %body.mime_type))]
pub async fn http_post_audio(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
  Json(body): Json<AudioIn>,
) -> ApiResult<SubmitOut> {
  let bytes = base64::engine::general_purpose::STANDARD
    .decode(body.audio_base64.trim())
    .map_err(|e| ApiError::BadRequest(format!("audioBase64 is not valid base64: {e}")))?;
  let audio = EncodedAudio::from_upload(bytes, body.mime_type);
  let submitted = state.submit(&id, Answer::Audio(audio)).await?;
  info!(target: "lesson", session_id = %id, ignored = submitted.ignored, passed = ?submitted.snapshot.passed, "HTTP recording evaluated");
  Ok(Json(SubmitOut { ignored: submitted.ignored, session: to_out(&id, submitted.snapshot) }))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_advance(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<SessionOut> {
  let snapshot = state.advance(&id).await?;
  Ok(Json(to_out(&id, snapshot)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_retry(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<SessionOut> {
  let snapshot = state.retry(&id).await?;
  Ok(Json(to_out(&id, snapshot)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_force_advance(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> ApiResult<SessionOut> {
  let snapshot = state.force_advance(&id).await?;
  Ok(Json(to_out(&id, snapshot)))
}

#[instrument(level = "info", skip(state))]
pub async fn http_get_user(
  State(state): State<Arc<AppState>>,
  Path(user_id): Path<String>,
) -> ApiResult<crate::domain::UserRecord> {
  Ok(Json(state.user(&user_id).await?))
}
