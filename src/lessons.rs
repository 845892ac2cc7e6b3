//! Task source: resolves a lesson id into its ordered task list.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::LessonCfg;
use crate::domain::Task;
use crate::error::SessionError;
use crate::seeds::{greetings_lesson, GREETINGS_LESSON_ID};

/// Lesson catalogue lookup. A missing lesson is fatal to the session and is
/// reported to the caller, never swallowed.
pub trait TaskSource: Send + Sync {
  fn tasks_for(&self, lesson_id: &str) -> Result<Vec<Task>, SessionError>;
}

/// Catalogue kept in memory: built-in lessons plus lessons from TOML config.
#[derive(Clone, Debug, Default)]
pub struct StaticTaskSource {
  lessons: HashMap<String, Vec<Task>>,
}

impl StaticTaskSource {
  /// Built-in lessons, overridden by configured lessons sharing an id.
  pub fn with_builtin(configured: &[LessonCfg]) -> Self {
    let mut source = Self::default();
    source.insert(GREETINGS_LESSON_ID, greetings_lesson());
    for lesson in configured {
      if lesson.tasks.is_empty() {
        warn!(target: "lesson", lesson_id = %lesson.id, "Skipping configured lesson without tasks");
        continue;
      }
      source.insert(&lesson.id, lesson.tasks.clone());
    }
    for (id, tasks) in &source.lessons {
      info!(target: "lesson", lesson_id = %id, tasks = tasks.len(), "Lesson available");
    }
    source
  }

  pub fn insert(&mut self, lesson_id: &str, tasks: Vec<Task>) {
    self.lessons.insert(lesson_id.to_string(), tasks);
  }
}

impl TaskSource for StaticTaskSource {
  fn tasks_for(&self, lesson_id: &str) -> Result<Vec<Task>, SessionError> {
    match self.lessons.get(lesson_id) {
      Some(tasks) if !tasks.is_empty() => Ok(tasks.clone()),
      _ => Err(SessionError::MissingLesson(lesson_id.to_string())),
    }
  }
}
