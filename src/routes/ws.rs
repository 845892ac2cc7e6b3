//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to the session registry. Most requests get a single JSON reply.
//! Grading runs off the socket loop (text answers wait on the scoring service,
//! recordings end on manual stop or silence), so those results are pushed
//! through a per-connection channel.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use base64::Engine as _;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::audio::CaptureHandle;
use crate::error::{CaptureError, SessionError};
use crate::protocol::{to_out, ClientWsMessage, ServerWsMessage};
use crate::session::Answer;
use crate::state::{AppState, Submitted};

const DEFAULT_SAMPLE_RATE: u32 = 16_000;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "lingualeap_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Per-connection state: the attached session and the push channel back to the socket.
struct Connection {
  session_id: Option<String>,
  push: mpsc::UnboundedSender<ServerWsMessage>,
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "lingualeap_backend", "WebSocket connected");
  let (push, mut pushed) = mpsc::unbounded_channel();
  let mut conn = Connection { session_id: None, push };

  loop {
    let outgoing = tokio::select! {
      incoming = socket.recv() => match incoming {
        Some(Ok(Message::Text(txt))) => match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(msg) => {
            if !matches!(msg, ClientWsMessage::AudioFrame { .. }) {
              debug!(target: "lingualeap_backend", "WS received: {:?}", &msg);
            }
            handle_client_ws(msg, &state, &mut conn).await
          }
          Err(e) => Some(ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) }),
        },
        Some(Ok(Message::Ping(payload))) => {
          let _ = socket.send(Message::Pong(payload)).await;
          None
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        Some(Ok(_)) => None,
      },
      Some(msg) = pushed.recv() => Some(msg),
    };

    let Some(reply) = outgoing else { continue };
    let out = serde_json::to_string(&reply).unwrap_or_else(|e| {
      serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
    });
    if let Err(e) = socket.send(Message::Text(out)).await {
      error!(target: "lingualeap_backend", error = %e, "WS send error");
      break;
    }
  }

  detach(&state, &conn).await;
  info!(target: "lingualeap_backend", "WebSocket disconnected");
}

/// A vanished client can no longer speak: cancel any capture and revoke the microphone.
async fn detach(state: &AppState, conn: &Connection) {
  let Some(id) = &conn.session_id else { return };
  if let Ok(entry) = state.session(id).await {
    entry.microphone.set_permission(false, 0);
    let engine = entry.controller.lock().await.capture_engine();
    if engine.is_active() {
      engine.teardown();
      debug!(target: "capture", session_id = %id, "Recording cancelled on disconnect");
    }
  }
}

fn error_reply(e: SessionError) -> Option<ServerWsMessage> {
  Some(ServerWsMessage::Error { message: e.to_string() })
}

#[instrument(level = "debug", skip_all)]
async fn handle_client_ws(msg: ClientWsMessage, state: &Arc<AppState>, conn: &mut Connection) -> Option<ServerWsMessage> {
  if let ClientWsMessage::Ping = msg {
    return Some(ServerWsMessage::Pong);
  }
  if let ClientWsMessage::Attach { session_id } = msg {
    return match state.snapshot(&session_id).await {
      Ok(snapshot) => {
        info!(target: "lingualeap_backend", %session_id, "WS attached to session");
        let out = to_out(&session_id, snapshot);
        conn.session_id = Some(session_id);
        Some(ServerWsMessage::Session { session: out })
      }
      Err(e) => error_reply(e),
    };
  }

  let Some(id) = conn.session_id.clone() else {
    return Some(ServerWsMessage::Error { message: "Attach to a session first".into() });
  };

  match msg {
    ClientWsMessage::Ping | ClientWsMessage::Attach { .. } => None,

    ClientWsMessage::GrantMicrophone { granted, sample_rate } => match state.session(&id).await {
      Ok(entry) => {
        entry.microphone.set_permission(granted, sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE));
        info!(target: "capture", session_id = %id, granted, "WS microphone permission updated");
        Some(ServerWsMessage::MicrophoneState { granted })
      }
      Err(e) => error_reply(e),
    },

    ClientWsMessage::StartRecording => match state.start_recording(&id).await {
      Ok(handle) => {
        spawn_recording_waiter(state.clone(), id, handle, conn.push.clone());
        Some(ServerWsMessage::RecordingStarted)
      }
      Err(e) => error_reply(e),
    },

    ClientWsMessage::AudioFrame { pcm } => {
      let bytes = match base64::engine::general_purpose::STANDARD.decode(pcm.trim()) {
        Ok(b) => b,
        Err(e) => return Some(ServerWsMessage::Error { message: format!("Invalid PCM frame: {}", e) }),
      };
      let samples: Vec<i16> = bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
      match state.session(&id).await {
        Ok(entry) => {
          if !entry.microphone.push_frame(samples) {
            debug!(target: "capture", session_id = %id, "Dropping frame: no recording in progress");
          }
          None
        }
        Err(e) => error_reply(e),
      }
    }

    // The waiter task pushes the result once the loop has ended.
    ClientWsMessage::StopRecording => match state.stop_recording(&id).await {
      Ok(_) => None,
      Err(e) => error_reply(e),
    },

    ClientWsMessage::SetAnswer { text } => match state.set_answer(&id, &text).await {
      Ok(snapshot) => Some(ServerWsMessage::Session { session: to_out(&id, snapshot) }),
      Err(e) => error_reply(e),
    },

    ClientWsMessage::SubmitAnswer { text } => {
      spawn_submission(state.clone(), id, Answer::Text(text), conn.push.clone());
      None
    }

    ClientWsMessage::Advance => match state.advance(&id).await {
      Ok(snapshot) => Some(ServerWsMessage::Session { session: to_out(&id, snapshot) }),
      Err(e) => error_reply(e),
    },

    ClientWsMessage::Retry => match state.retry(&id).await {
      Ok(snapshot) => Some(ServerWsMessage::Session { session: to_out(&id, snapshot) }),
      Err(e) => error_reply(e),
    },

    ClientWsMessage::ForceAdvance => match state.force_advance(&id).await {
      Ok(snapshot) => Some(ServerWsMessage::Session { session: to_out(&id, snapshot) }),
      Err(e) => error_reply(e),
    },
  }
}

/// Feedback first (if anything was graded), then the refreshed session.
fn push_submission(push: &mpsc::UnboundedSender<ServerWsMessage>, id: &str, submitted: Submitted) {
  let Submitted { ignored, snapshot } = submitted;
  if !ignored {
    if let (Some(feedback), Some(passed)) = (snapshot.feedback.clone(), snapshot.passed) {
      let _ = push.send(ServerWsMessage::Feedback { feedback, passed });
    }
  }
  let _ = push.send(ServerWsMessage::Session { session: to_out(id, snapshot) });
}

/// Grade off the socket loop; a second answer sent meanwhile comes back as ignored.
fn spawn_submission(
  state: Arc<AppState>,
  id: String,
  answer: Answer,
  push: mpsc::UnboundedSender<ServerWsMessage>,
) {
  tokio::spawn(async move {
    match state.submit(&id, answer).await {
      Ok(submitted) => push_submission(&push, &id, submitted),
      Err(e) => {
        debug!(target: "lesson", session_id = %id, error = %e, "WS submission rejected");
        let _ = push.send(ServerWsMessage::Error { message: e.to_string() });
      }
    }
  });
}

fn spawn_recording_waiter(
  state: Arc<AppState>,
  id: String,
  handle: CaptureHandle,
  push: mpsc::UnboundedSender<ServerWsMessage>,
) {
  tokio::spawn(async move {
    match state.finish_recording(&id, handle).await {
      Ok((reason, submitted)) => {
        info!(target: "capture", session_id = %id, ?reason, "Recording finished and graded");
        let _ = push.send(ServerWsMessage::RecordingStopped { reason });
        push_submission(&push, &id, submitted);
      }
      Err(SessionError::Capture(CaptureError::Cancelled)) | Err(SessionError::UnknownSession(_)) => {
        debug!(target: "capture", session_id = %id, "Recording cancelled");
      }
      Err(e) => {
        warn!(target: "capture", session_id = %id, error = %e, "Recording could not be graded");
        let _ = push.send(ServerWsMessage::Error { message: e.to_string() });
      }
    }
  });
}
