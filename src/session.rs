//! Lesson session controller: drives a learner through a lesson's tasks.
//!
//! Phases: `Presenting → AwaitingAnswer → Submitting → Feedback → (advance | retry | force advance)`,
//! ending in `Completed`.
//!
//! Submission is split in three steps so the scoring call can run without
//! holding the session: `begin_submission` (guard + validation + local shortcut),
//! `execute` (the gateway call, bounded by a timeout), and
//! `finish_submission` (applies the result unless the session moved on or was
//! torn down). The session registry chains them across its lock; tests use
//! `submit`, which chains them on a single owner.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::audio::{AudioCaptureEngine, CaptureHandle, CaptureProgress, EncodedAudio};
use crate::config::EngineSettings;
use crate::domain::{Feedback, Task, TaskKind, UserRecord};
use crate::error::{CaptureError, ScoringError, SessionError};
use crate::progress::ProgressStore;
use crate::scoring::ScoringGateway;
use crate::skills::{self, TaskOutcome};
use crate::users::UserRecordSink;
use crate::util::same_answer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
  Presenting,
  AwaitingAnswer,
  Submitting,
  Feedback,
  Completed,
}

impl SessionPhase {
  pub fn label(self) -> &'static str {
    match self {
      SessionPhase::Presenting => "presenting",
      SessionPhase::AwaitingAnswer => "awaiting_answer",
      SessionPhase::Submitting => "submitting",
      SessionPhase::Feedback => "feedback",
      SessionPhase::Completed => "completed",
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  InProgress,
  Completed,
}

#[derive(Clone, Debug)]
pub enum Answer {
  Text(String),
  Audio(EncodedAudio),
}

impl Answer {
  fn label(&self) -> &'static str {
    match self {
      Answer::Text(_) => "text",
      Answer::Audio(_) => "audio",
    }
  }
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionPorts {
  pub gateway: Arc<dyn ScoringGateway>,
  pub progress: Arc<dyn ProgressStore>,
  pub users: Arc<dyn UserRecordSink>,
  pub capture: Arc<AudioCaptureEngine>,
}

/// Everything needed to grade one submission, detached from the session.
#[derive(Clone, Debug)]
pub struct SubmissionTicket {
  generation: u64,
  task_index: usize,
  task: Task,
  answer: Answer,
}

/// Call the gateway for a ticket; a call that outlives `timeout` counts as unavailable.
pub async fn execute(
  ticket: &SubmissionTicket,
  gateway: &dyn ScoringGateway,
  timeout: Duration,
) -> Result<Feedback, ScoringError> {
  let call = async {
    match &ticket.answer {
      Answer::Text(text) => gateway.score_text(&ticket.task, text).await,
      Answer::Audio(audio) => gateway.score_pronunciation(&ticket.task, audio).await,
    }
  };
  match tokio::time::timeout(timeout, call).await {
    Ok(result) => result,
    Err(_) => Err(ScoringError::ServiceUnavailable(format!("no response within {}s", timeout.as_secs()))),
  }
}

#[derive(Debug)]
pub enum SubmissionStart {
  /// Another submission is still in flight; this one was dropped.
  Ignored,
  /// Graded locally, no gateway call needed.
  Resolved(Feedback),
  /// Grade with `execute`, then hand back via `finish_submission`.
  Pending(SubmissionTicket),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progression {
  Next { index: usize },
  Completed { total_xp: u64 },
}

/// Read-only view for transport layers.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
  pub user_id: String,
  pub lesson_id: String,
  pub status: SessionStatus,
  pub phase: SessionPhase,
  pub current_index: usize,
  pub total_tasks: usize,
  pub progress_percent: u8,
  pub accumulated_xp: u64,
  pub task: Task,
  pub answer_draft: String,
  pub feedback: Option<Feedback>,
  pub passed: Option<bool>,
  pub recording: Option<CaptureProgress>,
  pub updated_user: Option<UserRecord>,
}

pub struct LessonSessionController {
  user_id: String,
  lesson_id: String,
  tasks: Vec<Task>,
  current_index: usize,
  accumulated_xp: u64,
  status: SessionStatus,
  phase: SessionPhase,
  outcomes: Vec<Option<TaskOutcome>>,
  answer_draft: String,
  feedback: Option<Feedback>,
  recording: Option<CaptureHandle>,
  generation: u64,
  torn_down: bool,
  updated_user: Option<UserRecord>,
  settings: EngineSettings,
  ports: SessionPorts,
}

/// Absent checkpoint starts the lesson; one past the end is clamped onto the last task.
fn restore_index(checkpoint: Option<usize>, len: usize) -> usize {
  match checkpoint {
    None => 0,
    Some(i) if i < len => i,
    Some(i) => {
      warn!(target: "lesson", stored = i, tasks = len, "Checkpoint out of range; clamping to last task");
      len.saturating_sub(1)
    }
  }
}

impl LessonSessionController {
  /// Open a session for (user, lesson), resuming at the stored checkpoint.
  #[instrument(level = "info", skip(tasks, settings, ports), fields(tasks = tasks.len()))]
  pub async fn start(
    user_id: &str,
    lesson_id: &str,
    tasks: Vec<Task>,
    settings: EngineSettings,
    ports: SessionPorts,
  ) -> Result<Self, SessionError> {
    if tasks.is_empty() {
      return Err(SessionError::MissingLesson(lesson_id.to_string()));
    }

    let checkpoint = match ports.progress.load(user_id, lesson_id).await {
      Ok(c) => c,
      Err(e) => {
        error!(target: "lesson", %user_id, %lesson_id, error = %e, "Checkpoint unreadable; starting from the first task");
        None
      }
    };
    let current_index = restore_index(checkpoint, tasks.len());
    info!(target: "lesson", %user_id, %lesson_id, current_index, resumed = checkpoint.is_some(), "Session started");

    Ok(Self {
      user_id: user_id.to_string(),
      lesson_id: lesson_id.to_string(),
      outcomes: vec![None; tasks.len()],
      tasks,
      current_index,
      accumulated_xp: 0,
      status: SessionStatus::InProgress,
      phase: SessionPhase::Presenting,
      answer_draft: String::new(),
      feedback: None,
      recording: None,
      generation: 0,
      torn_down: false,
      updated_user: None,
      settings,
      ports,
    })
  }

  #[cfg(test)]
  pub fn current_index(&self) -> usize {
    self.current_index
  }

  pub fn current_task(&self) -> &Task {
    &self.tasks[self.current_index]
  }

  #[cfg(test)]
  pub fn phase(&self) -> SessionPhase {
    self.phase
  }

  #[cfg(test)]
  pub fn status(&self) -> SessionStatus {
    self.status
  }

  #[cfg(test)]
  pub fn accumulated_xp(&self) -> u64 {
    self.accumulated_xp
  }

  #[cfg(test)]
  pub fn feedback(&self) -> Option<&Feedback> {
    self.feedback.as_ref()
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }

  pub fn capture_engine(&self) -> Arc<AudioCaptureEngine> {
    self.ports.capture.clone()
  }

  pub fn gateway(&self) -> Arc<dyn ScoringGateway> {
    self.ports.gateway.clone()
  }

  pub fn snapshot(&self) -> SessionSnapshot {
    let total = self.tasks.len();
    let progress_percent = if self.status == SessionStatus::Completed {
      100
    } else {
      ((self.current_index + 1) * 100 / total) as u8
    };
    SessionSnapshot {
      user_id: self.user_id.clone(),
      lesson_id: self.lesson_id.clone(),
      status: self.status,
      phase: self.phase,
      current_index: self.current_index,
      total_tasks: total,
      progress_percent,
      accumulated_xp: self.accumulated_xp,
      task: self.current_task().clone(),
      answer_draft: self.answer_draft.clone(),
      feedback: self.feedback.clone(),
      passed: self.feedback.as_ref().map(|fb| fb.passes(self.settings.pass_threshold)),
      recording: self.recording_handle().and_then(|_| self.ports.capture.progress()),
      updated_user: self.updated_user.clone(),
    }
  }

  fn ensure_live(&self) -> Result<(), SessionError> {
    if self.torn_down {
      Err(SessionError::TornDown)
    } else {
      Ok(())
    }
  }

  fn ensure_answering(&self, action: &'static str) -> Result<(), SessionError> {
    self.ensure_live()?;
    match self.phase {
      SessionPhase::Presenting | SessionPhase::AwaitingAnswer => Ok(()),
      other => Err(SessionError::InvalidPhase { action, phase: other.label() }),
    }
  }

  /// Current feedback and whether it passes; only valid in the Feedback phase.
  fn decided_feedback(&self, action: &'static str) -> Result<bool, SessionError> {
    self.ensure_live()?;
    match (&self.phase, &self.feedback) {
      (SessionPhase::Feedback, Some(fb)) => Ok(fb.passes(self.settings.pass_threshold)),
      _ => Err(SessionError::InvalidPhase { action, phase: self.phase.label() }),
    }
  }

  /// Store a typed draft for the current task.
  pub fn set_answer(&mut self, text: &str) -> Result<(), SessionError> {
    self.ensure_answering("set_answer")?;
    self.answer_draft = text.to_string();
    self.phase = SessionPhase::AwaitingAnswer;
    Ok(())
  }

  /// Start recording for a Speaking task. A refused microphone leaves the task waiting for an answer.
  #[instrument(level = "info", skip(self), fields(lesson_id = %self.lesson_id, index = self.current_index))]
  pub async fn start_recording(&mut self) -> Result<CaptureHandle, SessionError> {
    self.ensure_answering("start_recording")?;
    let task_kind = &self.tasks[self.current_index].kind;
    if !matches!(task_kind, TaskKind::Speaking) {
      return Err(SessionError::AnswerKindMismatch { answer: "audio", task: task_kind.label() });
    }
    if self.recording.is_some() {
      return Err(CaptureError::AlreadyActive.into());
    }
    self.phase = SessionPhase::AwaitingAnswer;
    let handle = self.ports.capture.start_capture().await?;
    self.recording = Some(handle);
    Ok(handle)
  }

  /// Push-to-talk release. The loop ends and the clip becomes collectable.
  pub fn stop_recording(&mut self) -> Result<CaptureHandle, SessionError> {
    self.ensure_live()?;
    let handle = self.recording.ok_or(CaptureError::UnknownHandle)?;
    self.ports.capture.stop_capture(handle)?;
    Ok(handle)
  }

  pub fn recording_handle(&self) -> Option<CaptureHandle> {
    self.recording
  }

  /// Forget a recording whose clip was collected outside the session lock.
  pub fn release_recording(&mut self, handle: CaptureHandle) {
    if self.recording == Some(handle) {
      self.recording = None;
    }
  }

  /// Guard, validate and, for Reading tasks, try the local exact-match shortcut.
  #[instrument(level = "info", skip(self, answer), fields(lesson_id = %self.lesson_id, index = self.current_index, answer = answer.label()))]
  pub fn begin_submission(&mut self, answer: Answer) -> Result<SubmissionStart, SessionError> {
    self.ensure_live()?;
    if self.phase == SessionPhase::Submitting {
      debug!(target: "lesson", "Submission ignored: another one is in flight");
      return Ok(SubmissionStart::Ignored);
    }
    self.ensure_answering("submit")?;

    let task = &self.tasks[self.current_index];
    match (&task.kind, &answer) {
      (TaskKind::Speaking, Answer::Audio(audio)) if audio.bytes.is_empty() => return Err(SessionError::EmptyAnswer),
      (TaskKind::Speaking, Answer::Audio(_)) => {}
      (TaskKind::Speaking, Answer::Text(_)) | (_, Answer::Audio(_)) => {
        return Err(SessionError::AnswerKindMismatch { answer: answer.label(), task: task.kind.label() });
      }
      (TaskKind::Writing | TaskKind::Reading { .. } | TaskKind::Listening { .. }, Answer::Text(text)) => {
        if text.trim().is_empty() {
          return Err(SessionError::EmptyAnswer);
        }
      }
    }

    if let (TaskKind::Reading { .. }, Some(target), Answer::Text(choice)) = (&task.kind, task.target_text.as_deref(), &answer) {
      if same_answer(choice, target) {
        debug!(target: "lesson", task_id = %task.id, "Reading choice matches reference; gateway bypassed");
        let fb = Feedback::perfect(target, "Correct choice.");
        self.answer_draft = choice.clone();
        self.feedback = Some(fb.clone());
        self.phase = SessionPhase::Feedback;
        return Ok(SubmissionStart::Resolved(fb));
      }
    }

    match &answer {
      Answer::Text(text) => self.answer_draft = text.clone(),
      Answer::Audio(_) => self.recording = None,
    }
    self.generation += 1;
    self.feedback = None;
    self.phase = SessionPhase::Submitting;
    Ok(SubmissionStart::Pending(SubmissionTicket {
      generation: self.generation,
      task_index: self.current_index,
      task: task.clone(),
      answer,
    }))
  }

  /// Apply a graded result. Gateway failures become a zero-score Incorrect
  /// feedback so the learner can retry. Returns None when the result was
  /// discarded because the session was torn down or moved on.
  #[instrument(level = "info", skip(self, ticket, result), fields(lesson_id = %self.lesson_id, index = ticket.task_index, ok = result.is_ok()))]
  pub fn finish_submission(
    &mut self,
    ticket: SubmissionTicket,
    result: Result<Feedback, ScoringError>,
  ) -> Option<Feedback> {
    if self.torn_down || ticket.generation != self.generation || self.phase != SessionPhase::Submitting {
      warn!(target: "lesson", ticket_generation = ticket.generation, generation = self.generation, torn_down = self.torn_down, "Discarding stale scoring result");
      return None;
    }

    let fb = match result {
      Ok(fb) => fb,
      Err(e) => {
        warn!(target: "lesson", task_id = %ticket.task.id, error = %e, "Scoring failed; substituting zero-score feedback");
        unavailable_feedback(&e)
      }
    };
    info!(target: "lesson", task_id = %ticket.task.id, score = fb.score, classification = ?fb.classification, passed = fb.passes(self.settings.pass_threshold), "Feedback ready");
    self.feedback = Some(fb.clone());
    self.phase = SessionPhase::Feedback;
    Some(fb)
  }

  /// Begin, score and finish in one call.
  #[cfg(test)]
  pub async fn submit(&mut self, answer: Answer) -> Result<Option<Feedback>, SessionError> {
    match self.begin_submission(answer)? {
      SubmissionStart::Ignored => Ok(None),
      SubmissionStart::Resolved(fb) => Ok(Some(fb)),
      SubmissionStart::Pending(ticket) => {
        let gateway = self.ports.gateway.clone();
        let result = execute(&ticket, gateway.as_ref(), self.settings.scoring_timeout()).await;
        Ok(self.finish_submission(ticket, result))
      }
    }
  }

  /// Continue after a passing feedback. XP for the task is added exactly once.
  #[instrument(level = "info", skip(self), fields(lesson_id = %self.lesson_id, index = self.current_index))]
  pub async fn advance(&mut self) -> Result<Progression, SessionError> {
    if !self.decided_feedback("advance")? {
      return Err(SessionError::NotPassed);
    }
    let idx = self.current_index;
    if self.outcomes[idx].is_none() {
      self.accumulated_xp += u64::from(self.tasks[idx].xp_reward);
      self.outcomes[idx] = Some(TaskOutcome::Passed);
    }
    Ok(self.move_on().await)
  }

  /// Try the same task again after a failing feedback. No XP, no checkpoint write.
  pub fn retry(&mut self) -> Result<(), SessionError> {
    if self.decided_feedback("retry")? {
      return Err(SessionError::AlreadyPassed);
    }
    debug!(target: "lesson", index = self.current_index, "Retrying task");
    self.present();
    Ok(())
  }

  /// Give up on the task after a failing feedback: no XP, but the lesson moves on.
  #[instrument(level = "info", skip(self), fields(lesson_id = %self.lesson_id, index = self.current_index))]
  pub async fn force_advance(&mut self) -> Result<Progression, SessionError> {
    if self.decided_feedback("force_advance")? {
      return Err(SessionError::AlreadyPassed);
    }
    let idx = self.current_index;
    self.outcomes[idx].get_or_insert(TaskOutcome::Failed);
    Ok(self.move_on().await)
  }

  fn present(&mut self) {
    self.answer_draft.clear();
    self.feedback = None;
    self.recording = None;
    self.phase = SessionPhase::Presenting;
  }

  async fn move_on(&mut self) -> Progression {
    if self.current_index + 1 >= self.tasks.len() {
      self.complete().await;
      return Progression::Completed { total_xp: self.accumulated_xp };
    }

    self.current_index += 1;
    self.present();
    if let Err(e) = self.ports.progress.save(&self.user_id, &self.lesson_id, self.current_index).await {
      error!(target: "lesson", user_id = %self.user_id, lesson_id = %self.lesson_id, error = %e, "Failed to persist checkpoint");
    }
    info!(target: "lesson", index = self.current_index, xp = self.accumulated_xp, "Next task");
    Progression::Next { index: self.current_index }
  }

  async fn complete(&mut self) {
    if self.status == SessionStatus::Completed {
      return;
    }
    self.status = SessionStatus::Completed;
    self.phase = SessionPhase::Completed;
    self.feedback = None;

    let tally: Vec<(&Task, TaskOutcome)> = self
      .tasks
      .iter()
      .zip(&self.outcomes)
      .map(|(task, outcome)| (task, outcome.unwrap_or(TaskOutcome::Failed)))
      .collect();

    let user = match self.ports.users.load(&self.user_id).await {
      Ok(user) => user,
      Err(e) => {
        error!(target: "lesson", user_id = %self.user_id, error = %e, "Could not load user record; aggregating onto a blank one");
        UserRecord::new(&self.user_id)
      }
    };
    let updated = skills::aggregate(&user, &self.lesson_id, &tally, self.settings.skill_step);
    if let Err(e) = self.ports.users.save(updated.clone()).await {
      error!(target: "lesson", user_id = %self.user_id, error = %e, "Failed to save updated user record");
    }
    if let Err(e) = self.ports.progress.clear(&self.user_id, &self.lesson_id).await {
      error!(target: "lesson", user_id = %self.user_id, lesson_id = %self.lesson_id, error = %e, "Failed to clear checkpoint");
    }

    info!(
      target: "lesson",
      user_id = %self.user_id,
      lesson_id = %self.lesson_id,
      total_xp = self.accumulated_xp,
      passed = tally.iter().filter(|(_, o)| *o == TaskOutcome::Passed).count(),
      "Lesson completed"
    );
    self.updated_user = Some(updated);
  }

  /// Navigate-away: stop any capture, release the microphone, and make every
  /// later result a no-op. Safe to call more than once.
  pub fn teardown(&mut self) {
    if self.torn_down {
      return;
    }
    self.torn_down = true;
    self.generation += 1;
    self.recording = None;
    self.ports.capture.teardown();
    info!(target: "lesson", user_id = %self.user_id, lesson_id = %self.lesson_id, index = self.current_index, "Session torn down");
  }
}

impl Drop for LessonSessionController {
  fn drop(&mut self) {
    self.ports.capture.teardown();
  }
}

fn unavailable_feedback(err: &ScoringError) -> Feedback {
  let explanation = match err {
    ScoringError::ServiceUnavailable(reason) => {
      format!("The evaluation service could not be reached ({reason}). Your answer was not graded.")
    }
    ScoringError::MalformedResponse(reason) => {
      format!("The evaluation result could not be read ({reason}). Your answer was not graded.")
    }
  };
  Feedback::incorrect(explanation, "Please try this task again.")
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::config::CaptureSettings;
  use crate::domain::{Classification, Skill};
  use crate::progress::InMemoryProgressStore;
  use crate::testing::{Reply, ScriptedGateway, ScriptedMicrophone};
  use crate::users::InMemoryUserStore;

  struct Harness {
    gateway: ScriptedGateway,
    progress: Arc<InMemoryProgressStore>,
    users: Arc<InMemoryUserStore>,
    mic: Arc<ScriptedMicrophone>,
  }

  impl Harness {
    fn new(replies: Vec<Reply>) -> Self {
      Self::with_mic(replies, ScriptedMicrophone::granted(|_| 0.0))
    }

    fn with_mic(replies: Vec<Reply>, mic: ScriptedMicrophone) -> Self {
      Self {
        gateway: ScriptedGateway::new(replies),
        progress: Arc::new(InMemoryProgressStore::new()),
        users: Arc::new(InMemoryUserStore::new()),
        mic: Arc::new(mic),
      }
    }

    fn ports(&self) -> SessionPorts {
      let capture = CaptureSettings {
        sample_interval_ms: 50,
        silence_threshold: 0.1,
        silence_duration_ms: 500,
        amplitude_window: 8,
      };
      SessionPorts {
        gateway: Arc::new(self.gateway.clone()),
        progress: self.progress.clone(),
        users: self.users.clone(),
        capture: Arc::new(AudioCaptureEngine::new(self.mic.clone(), capture)),
      }
    }

    async fn open(&self, user: &str, tasks: Vec<Task>) -> LessonSessionController {
      LessonSessionController::start(user, "a1-1", tasks, EngineSettings::default(), self.ports())
        .await
        .unwrap()
    }
  }

  fn writing(id: &str, xp: u32) -> Task {
    Task {
      id: id.into(),
      kind: TaskKind::Writing,
      prompt: format!("prompt {id}"),
      target_text: Some("Good morning".into()),
      xp_reward: xp,
      skill_impact: Skill::Writing,
    }
  }

  fn speaking(id: &str, xp: u32) -> Task {
    Task { kind: TaskKind::Speaking, skill_impact: Skill::Speaking, ..writing(id, xp) }
  }

  fn reading(id: &str) -> Task {
    Task {
      kind: TaskKind::Reading { options: vec!["I am 20 years old.".into(), "I'm fine, thanks. And you?".into()] },
      target_text: Some("I'm fine, thanks. And you?".into()),
      skill_impact: Skill::Reading,
      ..writing(id, 10)
    }
  }

  fn text(s: &str) -> Answer {
    Answer::Text(s.into())
  }

  // XP is the sum of rewards of tasks eventually passed, so a task passed after retries still counts.
  #[tokio::test]
  async fn mixed_run_accumulates_xp_of_passed_tasks_only() {
    // Task 1 fails twice then passes, task 2 passes, task 3 fails and is skipped.
    let h = Harness::new(vec![Reply::Score(30), Reply::Score(45), Reply::Score(80), Reply::Score(90), Reply::Score(10)]);
    let tasks = vec![writing("t1", 10), writing("t2", 20), writing("t3", 10)];
    let mut s = h.open("ana", tasks).await;

    for _ in 0..2 {
      s.submit(text("hello")).await.unwrap();
      assert_eq!(s.advance().await.unwrap_err().to_string(), SessionError::NotPassed.to_string());
      s.retry().unwrap();
      assert_eq!(s.current_index(), 0);
      assert_eq!(h.progress.load("ana", "a1-1").await.unwrap(), None);
    }
    s.submit(text("Good morning")).await.unwrap();
    assert_eq!(s.advance().await.unwrap(), Progression::Next { index: 1 });

    s.submit(text("hi")).await.unwrap();
    assert_eq!(s.advance().await.unwrap(), Progression::Next { index: 2 });

    s.submit(text("bye")).await.unwrap();
    assert!(matches!(s.retry(), Ok(())));
    s.submit(text("bye")).await.unwrap();
    assert_eq!(s.force_advance().await.unwrap(), Progression::Completed { total_xp: 30 });

    assert_eq!(s.status(), SessionStatus::Completed);
    assert_eq!(h.progress.load("ana", "a1-1").await.unwrap(), None);
    let user = h.users.load("ana").await.unwrap();
    assert_eq!(user.xp, 30);
    assert_eq!(user.skills.writing, 5);
    assert_eq!(user.completed_lessons, vec!["a1-1".to_string()]);
  }

  #[tokio::test]
  async fn skipping_failed_tasks_earns_only_the_passed_reward() {
    let h = Harness::new(vec![Reply::Score(20), Reply::Score(35), Reply::Score(95), Reply::Score(0)]);
    let tasks = vec![writing("t1", 10), speaking("t2", 20), writing("t3", 10)];
    let mut s = h.open("ana", tasks).await;

    s.submit(text("x")).await.unwrap();
    s.retry().unwrap();
    s.submit(text("x")).await.unwrap();
    s.force_advance().await.unwrap();

    let handle = s.start_recording().await.unwrap();
    s.stop_recording().unwrap();
    assert_eq!(s.recording_handle(), Some(handle));
    let clip = s.capture_engine().on_capture_complete(handle).await.unwrap();
    s.release_recording(handle);
    s.submit(Answer::Audio(clip.audio)).await.unwrap();
    s.advance().await.unwrap();

    s.submit(text("x")).await.unwrap();
    let done = s.force_advance().await.unwrap();

    assert_eq!(done, Progression::Completed { total_xp: 20 });
    assert_eq!(s.status(), SessionStatus::Completed);
    assert_eq!(h.progress.load("ana", "a1-1").await.unwrap(), None);
    let user = h.users.load("ana").await.unwrap();
    assert_eq!(user.skills.speaking, 5);
    assert_eq!(user.skills.writing, 0);
    assert_eq!(h.gateway.audio_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn resume_restores_the_exact_index() {
    let h = Harness::new(vec![Reply::Score(100)]);
    let tasks = vec![writing("t1", 10), writing("t2", 10), writing("t3", 10), writing("t4", 10)];

    let mut s = h.open("ana", tasks.clone()).await;
    for _ in 0..2 {
      s.submit(text("a")).await.unwrap();
      s.advance().await.unwrap();
    }
    assert_eq!(s.current_index(), 2);
    s.teardown();
    drop(s);

    let resumed = h.open("ana", tasks.clone()).await;
    assert_eq!(resumed.current_index(), 2);
    assert_eq!(resumed.phase(), SessionPhase::Presenting);

    let other = h.open("bob", tasks).await;
    assert_eq!(other.current_index(), 0);
  }

  #[tokio::test]
  async fn out_of_range_checkpoint_is_clamped() {
    let h = Harness::new(vec![]);
    h.progress.save("ana", "a1-1", 99).await.unwrap();
    let s = h.open("ana", vec![writing("t1", 1), writing("t2", 1), writing("t3", 1)]).await;
    assert_eq!(s.current_index(), 2);
  }

  #[tokio::test]
  async fn empty_lesson_cannot_start() {
    let h = Harness::new(vec![]);
    let err = LessonSessionController::start("ana", "ghost", vec![], EngineSettings::default(), h.ports())
      .await
      .err()
      .unwrap();
    assert!(matches!(err, SessionError::MissingLesson(id) if id == "ghost"));
  }

  #[tokio::test]
  async fn second_submission_is_ignored_while_one_is_in_flight() {
    let h = Harness::new(vec![Reply::Score(90)]);
    let mut s = h.open("ana", vec![writing("t1", 10)]).await;

    let SubmissionStart::Pending(ticket) = s.begin_submission(text("one")).unwrap() else {
      panic!("expected a pending submission");
    };
    assert!(matches!(s.begin_submission(text("two")).unwrap(), SubmissionStart::Ignored));
    assert_eq!(s.phase(), SessionPhase::Submitting);
    assert!(matches!(s.advance().await, Err(SessionError::InvalidPhase { .. })));

    let result = execute(&ticket, &h.gateway, Duration::from_secs(5)).await;
    assert!(s.finish_submission(ticket, result).is_some());
    assert_eq!(h.gateway.calls(), 1);
  }

  #[tokio::test]
  async fn passed_task_cannot_be_resubmitted_or_counted_twice() {
    let h = Harness::new(vec![Reply::Score(90)]);
    let mut s = h.open("ana", vec![writing("t1", 10), writing("t2", 20)]).await;

    s.submit(text("a")).await.unwrap();
    assert!(matches!(s.submit(text("a")).await, Err(SessionError::InvalidPhase { .. })));
    assert!(matches!(s.retry(), Err(SessionError::AlreadyPassed)));
    assert!(matches!(s.force_advance().await, Err(SessionError::AlreadyPassed)));
    s.advance().await.unwrap();
    assert!(matches!(s.advance().await, Err(SessionError::InvalidPhase { .. })));
    assert_eq!(s.accumulated_xp(), 10);
    assert_eq!(h.progress.load("ana", "a1-1").await.unwrap(), Some(1));
  }

  #[tokio::test]
  async fn draft_answers_are_kept_until_the_task_changes() {
    let h = Harness::new(vec![Reply::Score(20)]);
    let mut s = h.open("ana", vec![writing("t1", 10), writing("t2", 10)]).await;

    s.set_answer("Good mor").unwrap();
    assert_eq!(s.phase(), SessionPhase::AwaitingAnswer);
    assert_eq!(s.snapshot().answer_draft, "Good mor");

    s.submit(text("Good morning")).await.unwrap();
    assert!(matches!(s.set_answer("x"), Err(SessionError::InvalidPhase { action: "set_answer", phase: "feedback" })));
    s.force_advance().await.unwrap();
    assert_eq!(s.snapshot().answer_draft, "");
    assert_eq!(s.current_task().id, "t2");
  }

  #[tokio::test]
  async fn reading_exact_match_skips_the_gateway() {
    let h = Harness::new(vec![Reply::Score(10)]);
    let mut s = h.open("ana", vec![reading("t3")]).await;

    let fb = s.submit(text("  i'm FINE, thanks. and you? ")).await.unwrap().unwrap();
    assert_eq!(fb.classification, Classification::Perfect);
    assert_eq!(fb.score, 100);
    assert_eq!(s.feedback(), Some(&fb));
    assert_eq!(s.phase(), SessionPhase::Feedback);
    assert_eq!(h.gateway.calls(), 0);
  }

  #[tokio::test]
  async fn reading_mismatch_goes_to_the_gateway() {
    let h = Harness::new(vec![Reply::Score(10)]);
    let mut s = h.open("ana", vec![reading("t3")]).await;

    let fb = s.submit(text("I am 20 years old.")).await.unwrap().unwrap();
    assert_eq!(fb.score, 10);
    assert_eq!(h.gateway.calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn gateway_timeout_yields_retryable_zero_feedback() {
    let h = Harness::new(vec![Reply::Hang]);
    let mut s = h.open("ana", vec![writing("t1", 10)]).await;

    let fb = s.submit(text("hello")).await.unwrap().unwrap();
    assert_eq!(fb.classification, Classification::Incorrect);
    assert_eq!(fb.score, 0);
    assert!(!fb.explanation.is_empty());
    assert!(fb.explanation.contains("could not be reached"));

    s.retry().unwrap();
    assert_eq!(s.phase(), SessionPhase::Presenting);
    assert_eq!(s.current_index(), 0);
    assert_eq!(s.accumulated_xp(), 0);
  }

  #[tokio::test]
  async fn malformed_response_also_falls_back() {
    let h = Harness::new(vec![Reply::Fail(ScoringError::MalformedResponse("missing score".into()))]);
    let mut s = h.open("ana", vec![writing("t1", 10)]).await;

    let fb = s.submit(text("hello")).await.unwrap().unwrap();
    assert_eq!(fb.score, 0);
    assert!(fb.explanation.contains("missing score"));
  }

  #[tokio::test]
  async fn result_arriving_after_teardown_is_discarded() {
    let h = Harness::new(vec![Reply::Score(100)]);
    let mut s = h.open("ana", vec![writing("t1", 10), writing("t2", 10)]).await;

    let SubmissionStart::Pending(ticket) = s.begin_submission(text("a")).unwrap() else {
      panic!("expected a pending submission");
    };
    s.teardown();
    let result = execute(&ticket, &h.gateway, Duration::from_secs(5)).await;

    assert!(s.finish_submission(ticket, result).is_none());
    assert_eq!(s.feedback(), None);
    assert_eq!(s.accumulated_xp(), 0);
    assert!(matches!(s.advance().await, Err(SessionError::TornDown)));
    assert_eq!(h.progress.load("ana", "a1-1").await.unwrap(), None);
  }

  #[tokio::test]
  async fn answers_are_validated_against_the_task_kind() {
    let h = Harness::new(vec![Reply::Score(100)]);
    let mut s = h.open("ana", vec![writing("t1", 10), speaking("t2", 10)]).await;

    assert!(matches!(s.submit(text("   ")).await, Err(SessionError::EmptyAnswer)));
    let audio = Answer::Audio(EncodedAudio::from_upload(vec![1, 2], "audio/webm"));
    assert!(matches!(s.submit(audio).await, Err(SessionError::AnswerKindMismatch { answer: "audio", task: "writing" })));
    assert!(matches!(s.start_recording().await, Err(SessionError::AnswerKindMismatch { .. })));

    s.submit(text("ok")).await.unwrap();
    s.advance().await.unwrap();
    assert!(matches!(s.submit(text("spoken?")).await, Err(SessionError::AnswerKindMismatch { answer: "text", task: "speaking" })));
  }

  #[tokio::test]
  async fn denied_microphone_keeps_the_task_waiting() {
    let h = Harness::with_mic(vec![], ScriptedMicrophone::denied());
    let mut s = h.open("ana", vec![speaking("t1", 10)]).await;

    let err = s.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::Capture(CaptureError::PermissionDenied)));
    assert_eq!(s.phase(), SessionPhase::AwaitingAnswer);
    assert_eq!(s.recording_handle(), None);
    assert!(s.snapshot().recording.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn silent_recording_stops_itself_and_is_graded() {
    let h = Harness::new(vec![Reply::Score(75)]);
    let counters = h.mic.counters();
    let mut s = h.open("ana", vec![speaking("t1", 20)]).await;

    let handle = s.start_recording().await.unwrap();
    let clip = s.capture_engine().on_capture_complete(handle).await.unwrap();
    s.release_recording(handle);
    assert_eq!(s.recording_handle(), None);
    assert_eq!(clip.stop_reason, crate::audio::StopReason::Silence);
    assert!(counters.released());

    let fb = s.submit(Answer::Audio(clip.audio)).await.unwrap().unwrap();
    assert_eq!(fb.score, 75);
    assert_eq!(s.advance().await.unwrap(), Progression::Completed { total_xp: 20 });
  }

  #[tokio::test(start_paused = true)]
  async fn teardown_while_recording_releases_the_microphone() {
    let h = Harness::with_mic(vec![], ScriptedMicrophone::granted(|_| 0.8));
    let counters = h.mic.counters();
    let mut s = h.open("ana", vec![speaking("t1", 20)]).await;

    s.start_recording().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    s.teardown();
    for _ in 0..10 {
      if counters.released() {
        break;
      }
      tokio::task::yield_now().await;
    }
    assert!(counters.released());
    assert!(matches!(s.start_recording().await, Err(SessionError::TornDown)));
  }

  #[tokio::test]
  async fn index_never_decreases_and_stays_in_bounds() {
    // Alternate failing and passing scores, mixing retry and force-advance.
    let replies = (0..40).map(|i| Reply::Score(if i % 3 == 0 { 20 } else { 90 })).collect();
    let h = Harness::new(replies);
    let tasks: Vec<Task> = (0..6).map(|i| writing(&format!("t{i}"), 5)).collect();
    let len = tasks.len();
    let mut s = h.open("ana", tasks).await;

    let mut last = s.current_index();
    let mut step = 0;
    while s.status() == SessionStatus::InProgress {
      s.submit(text("answer")).await.unwrap();
      let passed = s.snapshot().passed.unwrap();
      if passed {
        s.advance().await.unwrap();
      } else if step % 2 == 0 {
        s.retry().unwrap();
      } else {
        s.force_advance().await.unwrap();
      }
      assert!(s.current_index() >= last);
      assert!(s.current_index() < len);
      last = s.current_index();
      step += 1;
    }
    let user = h.users.load("ana").await.unwrap();
    assert_eq!(user.xp, s.accumulated_xp());
  }

  #[tokio::test]
  async fn snapshot_reports_progress_and_completion_record() {
    let h = Harness::new(vec![Reply::Score(100)]);
    let mut s = h.open("ana", vec![writing("t1", 10), writing("t2", 10)]).await;

    let snap = s.snapshot();
    assert_eq!(snap.progress_percent, 50);
    assert_eq!(snap.total_tasks, 2);
    assert!(snap.updated_user.is_none());

    for _ in 0..2 {
      s.submit(text("a")).await.unwrap();
      s.advance().await.unwrap();
    }
    let snap = s.snapshot();
    assert_eq!(snap.progress_percent, 100);
    assert_eq!(snap.phase, SessionPhase::Completed);
    assert_eq!(snap.updated_user.unwrap().xp, 20);
  }
}
