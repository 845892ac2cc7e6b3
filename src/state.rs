//! Application state: lesson catalogue, scoring gateway, stores, and the live session registry.
//!
//! This module owns:
//!   - the task source (built-in lessons plus TOML lessons)
//!   - the scoring gateway (OpenAI when configured, offline grader otherwise)
//!   - checkpoint and user record stores
//!   - open sessions, each with its own capture engine fed by a `ChannelMicrophone`
//!
//! Gateway calls run without holding a session's lock, so a slow grader never
//! blocks reads, teardown or a second (ignored) submission.

use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audio::{AudioCaptureEngine, CaptureHandle, ChannelMicrophone, StopReason};
use crate::config::{load_lesson_config_from_env, CaptureSettings, EngineSettings};
use crate::domain::UserRecord;
use crate::error::SessionError;
use crate::lessons::{StaticTaskSource, TaskSource};
use crate::openai::OpenAI;
use crate::progress::{FileProgressStore, InMemoryProgressStore, ProgressStore};
use crate::scoring::{OfflineScoring, ScoringGateway};
use crate::session::{execute, Answer, LessonSessionController, SessionPorts, SessionSnapshot, SubmissionStart};
use crate::users::{InMemoryUserStore, UserRecordSink};

/// One open lesson session and the microphone its WebSocket client feeds.
#[derive(Clone)]
pub struct SessionEntry {
    pub controller: Arc<Mutex<LessonSessionController>>,
    pub microphone: ChannelMicrophone,
}

/// Outcome of a submission as seen by transports.
#[derive(Debug)]
pub struct Submitted {
    /// True when nothing was graded: another submission was in flight or the
    /// result arrived after the session was closed.
    pub ignored: bool,
    pub snapshot: SessionSnapshot,
}

pub struct AppState {
    pub lessons: Arc<dyn TaskSource>,
    pub gateway: Arc<dyn ScoringGateway>,
    pub progress: Arc<dyn ProgressStore>,
    pub users: Arc<dyn UserRecordSink>,
    pub engine: EngineSettings,
    pub capture: CaptureSettings,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl AppState {
    /// Build state from env: load config, build the lesson catalogue, pick gateway and stores.
    #[instrument(level = "info", skip_all)]
    pub async fn from_env() -> Self {
        let cfg = load_lesson_config_from_env().unwrap_or_default();
        let lessons = StaticTaskSource::with_builtin(&cfg.lessons);

        let gateway: Arc<dyn ScoringGateway> =
            match OpenAI::from_env(cfg.prompts.clone(), cfg.engine.scoring_timeout()) {
                Some(oa) => {
                    info!(target: "lingualeap_backend", base_url = %oa.base_url, scoring_model = %oa.scoring_model, audio_model = %oa.audio_model, "OpenAI scoring enabled.");
                    Arc::new(oa)
                }
                None => {
                    warn!(target: "lingualeap_backend", "OpenAI disabled (no OPENAI_API_KEY or client setup failed). Using offline scoring; speaking tasks cannot be graded.");
                    Arc::new(OfflineScoring)
                }
            };

        let progress: Arc<dyn ProgressStore> = match std::env::var("PROGRESS_PATH") {
            Ok(path) if !path.trim().is_empty() => match FileProgressStore::open(PathBuf::from(&path)).await {
                Ok(store) => {
                    info!(target: "progress", %path, "Checkpoints persisted to file");
                    Arc::new(store)
                }
                Err(e) => {
                    error!(target: "progress", %path, error = %e, "Checkpoint file unusable; keeping checkpoints in memory");
                    Arc::new(InMemoryProgressStore::new())
                }
            },
            _ => {
                info!(target: "progress", "PROGRESS_PATH not set; checkpoints kept in memory");
                Arc::new(InMemoryProgressStore::new())
            }
        };

        Self::new(
            Arc::new(lessons),
            gateway,
            progress,
            Arc::new(InMemoryUserStore::new()),
            cfg.engine,
            cfg.capture,
        )
    }

    pub fn new(
        lessons: Arc<dyn TaskSource>,
        gateway: Arc<dyn ScoringGateway>,
        progress: Arc<dyn ProgressStore>,
        users: Arc<dyn UserRecordSink>,
        engine: EngineSettings,
        capture: CaptureSettings,
    ) -> Self {
        Self { lessons, gateway, progress, users, engine, capture, sessions: RwLock::new(HashMap::new()) }
    }

    /// Start (or resume from checkpoint) a lesson for a user.
    #[instrument(level = "info", skip(self))]
    pub async fn open_session(&self, user_id: &str, lesson_id: &str) -> Result<(String, SessionSnapshot), SessionError> {
        let tasks = self.lessons.tasks_for(lesson_id)?;
        let microphone = ChannelMicrophone::new();
        let ports = SessionPorts {
            gateway: self.gateway.clone(),
            progress: self.progress.clone(),
            users: self.users.clone(),
            capture: Arc::new(AudioCaptureEngine::new(Arc::new(microphone.clone()), self.capture.clone())),
        };
        let controller = LessonSessionController::start(user_id, lesson_id, tasks, self.engine.clone(), ports).await?;
        let snapshot = controller.snapshot();

        let id = Uuid::new_v4().to_string();
        self.sessions.write().await.insert(
            id.clone(),
            SessionEntry { controller: Arc::new(Mutex::new(controller)), microphone },
        );
        info!(target: "lesson", session_id = %id, %user_id, %lesson_id, index = snapshot.current_index, "Session opened");
        Ok((id, snapshot))
    }

    pub async fn session(&self, id: &str) -> Result<SessionEntry, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    pub async fn snapshot(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let entry = self.session(id).await?;
        let controller = entry.controller.lock().await;
        Ok(controller.snapshot())
    }

    /// Navigate away: tear the session down and forget it.
    #[instrument(level = "info", skip(self))]
    pub async fn close_session(&self, id: &str) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        entry.microphone.set_permission(false, 0);
        entry.controller.lock().await.teardown();
        Ok(())
    }

    /// Submit an answer. The gateway call happens between two short critical sections.
    #[instrument(level = "info", skip(self, answer))]
    pub async fn submit(&self, id: &str, answer: Answer) -> Result<Submitted, SessionError> {
        let entry = self.session(id).await?;
        let (ticket, gateway, timeout) = {
            let mut controller = entry.controller.lock().await;
            match controller.begin_submission(answer)? {
                SubmissionStart::Ignored => {
                    return Ok(Submitted { ignored: true, snapshot: controller.snapshot() });
                }
                SubmissionStart::Resolved(feedback) => {
                    debug!(target: "lesson", session_id = %id, score = feedback.score, "Graded locally");
                    return Ok(Submitted { ignored: false, snapshot: controller.snapshot() });
                }
                SubmissionStart::Pending(ticket) => {
                    (ticket, controller.gateway(), controller.settings().scoring_timeout())
                }
            }
        };

        let result = execute(&ticket, gateway.as_ref(), timeout).await;

        let mut controller = entry.controller.lock().await;
        let applied = controller.finish_submission(ticket, result).is_some();
        Ok(Submitted { ignored: !applied, snapshot: controller.snapshot() })
    }

    pub async fn set_answer(&self, id: &str, text: &str) -> Result<SessionSnapshot, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.set_answer(text)?;
        Ok(controller.snapshot())
    }

    pub async fn advance(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.advance().await?;
        Ok(controller.snapshot())
    }

    pub async fn retry(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.retry()?;
        Ok(controller.snapshot())
    }

    pub async fn force_advance(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.force_advance().await?;
        Ok(controller.snapshot())
    }

    pub async fn start_recording(&self, id: &str) -> Result<CaptureHandle, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.start_recording().await
    }

    pub async fn stop_recording(&self, id: &str) -> Result<CaptureHandle, SessionError> {
        let entry = self.session(id).await?;
        let mut controller = entry.controller.lock().await;
        controller.stop_recording()
    }

    /// Wait for a recording to end (manual stop or silence), then grade the clip.
    #[instrument(level = "info", skip(self))]
    pub async fn finish_recording(&self, id: &str, handle: CaptureHandle) -> Result<(StopReason, Submitted), SessionError> {
        let entry = self.session(id).await?;
        let engine = entry.controller.lock().await.capture_engine();
        let clip = engine.on_capture_complete(handle).await;
        entry.controller.lock().await.release_recording(handle);

        let clip = clip?;
        let stop_reason = clip.stop_reason;
        info!(target: "capture", session_id = %id, ?stop_reason, elapsed_ticks = clip.elapsed_ticks, bytes = clip.audio.bytes.len(), "Recording collected");
        let submitted = self.submit(id, Answer::Audio(clip.audio)).await?;
        Ok((stop_reason, submitted))
    }

    pub async fn user(&self, user_id: &str) -> Result<UserRecord, SessionError> {
        Ok(self.users.load(user_id).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{Skill, Task, TaskKind};
    use crate::testing::{Reply, ScriptedGateway};

    pub(crate) fn test_state(replies: Vec<Reply>) -> (Arc<AppState>, ScriptedGateway) {
        let gateway = ScriptedGateway::new(replies);
        let mut lessons = StaticTaskSource::with_builtin(&[]);
        lessons.insert(
            "mini",
            vec![
                Task {
                    id: "w1".into(),
                    kind: TaskKind::Writing,
                    prompt: "Say hello formally".into(),
                    target_text: Some("Good morning".into()),
                    xp_reward: 10,
                    skill_impact: Skill::Writing,
                },
                Task {
                    id: "s1".into(),
                    kind: TaskKind::Speaking,
                    prompt: "Read aloud".into(),
                    target_text: Some("Nice to meet you".into()),
                    xp_reward: 20,
                    skill_impact: Skill::Speaking,
                },
            ],
        );
        let capture = CaptureSettings {
            sample_interval_ms: 50,
            silence_threshold: 0.1,
            silence_duration_ms: 300,
            amplitude_window: 8,
        };
        let state = AppState::new(
            Arc::new(lessons),
            Arc::new(gateway.clone()),
            Arc::new(InMemoryProgressStore::new()),
            Arc::new(InMemoryUserStore::new()),
            EngineSettings::default(),
            capture,
        );
        (Arc::new(state), gateway)
    }

    #[tokio::test]
    async fn unknown_lessons_and_sessions_are_reported() {
        let (state, _) = test_state(vec![]);
        assert!(matches!(state.open_session("ana", "nope").await, Err(SessionError::MissingLesson(_))));
        assert!(matches!(state.snapshot("nope").await, Err(SessionError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn submission_round_trip_through_the_registry() {
        let (state, gateway) = test_state(vec![Reply::Score(80)]);
        let (id, snap) = state.open_session("ana", "mini").await.unwrap();
        assert_eq!(snap.current_index, 0);

        let submitted = state.submit(&id, Answer::Text("Good morning".into())).await.unwrap();
        assert!(!submitted.ignored);
        assert_eq!(submitted.snapshot.passed, Some(true));
        assert_eq!(gateway.calls(), 1);

        let snap = state.advance(&id).await.unwrap();
        assert_eq!(snap.current_index, 1);
        assert_eq!(state.progress.load("ana", "mini").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn closed_sessions_are_gone_and_resume_from_checkpoint() {
        let (state, _) = test_state(vec![Reply::Score(90)]);
        let (id, _) = state.open_session("ana", "mini").await.unwrap();
        state.submit(&id, Answer::Text("hi".into())).await.unwrap();
        state.advance(&id).await.unwrap();
        state.close_session(&id).await.unwrap();

        assert!(matches!(state.snapshot(&id).await, Err(SessionError::UnknownSession(_))));
        let (_, snap) = state.open_session("ana", "mini").await.unwrap();
        assert_eq!(snap.current_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_silence_auto_stops_and_is_graded() {
        let (state, gateway) = test_state(vec![Reply::Score(100), Reply::Score(70)]);
        let (id, _) = state.open_session("ana", "mini").await.unwrap();
        state.submit(&id, Answer::Text("Good morning".into())).await.unwrap();
        state.advance(&id).await.unwrap();

        let entry = state.session(&id).await.unwrap();
        entry.microphone.set_permission(true, 16_000);
        let handle = state.start_recording(&id).await.unwrap();
        assert!(entry.microphone.push_frame(vec![0; 800]));

        let (reason, submitted) = state.finish_recording(&id, handle).await.unwrap();
        assert_eq!(reason, StopReason::Silence);
        assert_eq!(submitted.snapshot.feedback.map(|fb| fb.score), Some(70));
        assert_eq!(gateway.audio_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!entry.microphone.push_frame(vec![0; 10]));
    }
}
