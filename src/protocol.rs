//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::audio::{CaptureProgress, StopReason};
use crate::domain::{Feedback, Skill, Task, TaskKind, UserRecord};
use crate::session::{SessionPhase, SessionSnapshot, SessionStatus};

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    /// Bind this connection to an open session.
    Attach {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    GrantMicrophone {
        granted: bool,
        #[serde(rename = "sampleRate", default)]
        sample_rate: Option<u32>,
    },
    StartRecording,
    /// Base64 of little-endian 16-bit mono PCM.
    AudioFrame {
        pcm: String,
    },
    StopRecording,
    SetAnswer {
        text: String,
    },
    SubmitAnswer {
        text: String,
    },
    Advance,
    Retry,
    ForceAdvance,
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Session {
        session: SessionOut,
    },
    MicrophoneState {
        granted: bool,
    },
    RecordingStarted,
    RecordingStopped {
        reason: StopReason,
    },
    Feedback {
        feedback: Feedback,
        passed: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionIn {
    pub user_id: String,
    pub lesson_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerIn {
    pub text: String,
}

/// Pre-recorded clip uploaded in one piece.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioIn {
    pub audio_base64: String,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOut {
    /// True when the submission was dropped (another one was in flight).
    pub ignored: bool,
    pub session: SessionOut,
}

/// Task as shown to the learner. Reference answers stay on the server,
/// except for Speaking tasks where the sentence to read is the prompt itself.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOut {
    pub id: String,
    pub kind: TaskKind,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_text: Option<String>,
    pub xp_reward: u32,
    pub skill_impact: Skill,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOut {
    pub session_id: String,
    pub user_id: String,
    pub lesson_id: String,
    pub status: SessionStatus,
    pub phase: SessionPhase,
    pub current_index: usize,
    pub total_tasks: usize,
    pub progress_percent: u8,
    pub accumulated_xp: u64,
    pub task: TaskOut,
    pub answer_draft: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<CaptureProgress>,
    /// Updated learner record, present once the lesson is completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
}

pub fn task_out(t: &Task) -> TaskOut {
    TaskOut {
        id: t.id.clone(),
        kind: t.kind.clone(),
        prompt: t.prompt.clone(),
        target_text: match t.kind {
            TaskKind::Speaking => t.target_text.clone(),
            _ => None,
        },
        xp_reward: t.xp_reward,
        skill_impact: t.skill_impact,
    }
}

/// Convert an internal snapshot to the public DTO.
pub fn to_out(session_id: &str, s: SessionSnapshot) -> SessionOut {
    SessionOut {
        session_id: session_id.to_string(),
        task: task_out(&s.task),
        user_id: s.user_id,
        lesson_id: s.lesson_id,
        status: s.status,
        phase: s.phase,
        current_index: s.current_index,
        total_tasks: s.total_tasks,
        progress_percent: s.progress_percent,
        accumulated_xp: s.accumulated_xp,
        answer_draft: s.answer_draft,
        feedback: s.feedback,
        passed: s.passed,
        recording: s.recording,
        user: s.updated_user,
    }
}
