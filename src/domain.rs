//! Domain models used by the backend: tasks, feedback, user records.

use serde::{Deserialize, Serialize};

/// Which of the four skills a task strengthens.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
  Speaking,
  Listening,
  Reading,
  Writing,
}

/// What kind of exercise is presented to the learner?
/// Kind-specific data lives on the variant itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
  /// Learner types a free answer.
  Writing,
  /// Learner records audio; graded for pronunciation against `target_text`.
  Speaking,
  /// Learner picks one of a fixed set of options.
  Reading { options: Vec<String> },
  /// Learner hears `audio_text` (synthesized client-side) and types what they heard.
  Listening { audio_text: String },
}

impl TaskKind {
  pub fn label(&self) -> &'static str {
    match self {
      TaskKind::Writing => "writing",
      TaskKind::Speaking => "speaking",
      TaskKind::Reading { .. } => "reading",
      TaskKind::Listening { .. } => "listening",
    }
  }
}

/// Immutable definition of one exercise within a lesson.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
  pub id: String,
  pub kind: TaskKind,
  pub prompt: String,
  #[serde(default)] pub target_text: Option<String>,
  #[serde(default)] pub xp_reward: u32,
  pub skill_impact: Skill,
}

/// Four-way verdict returned by the grader.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
  /// Correct, natural and idiomatic.
  Perfect,
  /// Correct, but a more fluent phrasing exists.
  Improvable,
  /// Understandable but reads like a literal translation.
  Unnatural,
  /// Errors that hinder clarity.
  Incorrect,
}

impl Classification {
  /// Lenient parse used on service responses ("perfect", "PERFECT", " Perfect ").
  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_ascii_uppercase().as_str() {
      "PERFECT" => Some(Classification::Perfect),
      "IMPROVABLE" => Some(Classification::Improvable),
      "UNNATURAL" => Some(Classification::Unnatural),
      "INCORRECT" => Some(Classification::Incorrect),
      _ => None,
    }
  }
}

/// Normalized result of one graded submission. Lives only as long as the
/// current task's feedback display.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feedback {
  pub classification: Classification,
  pub score: u8,
  pub explanation: String,
  pub correction: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub natural_alternative: Option<String>,
}

impl Feedback {
  pub fn perfect(correction: impl Into<String>, explanation: impl Into<String>) -> Self {
    Self {
      classification: Classification::Perfect,
      score: 100,
      explanation: explanation.into(),
      correction: correction.into(),
      natural_alternative: None,
    }
  }

  /// Zero-score verdict used whenever grading could not happen.
  pub fn incorrect(explanation: impl Into<String>, correction: impl Into<String>) -> Self {
    Self {
      classification: Classification::Incorrect,
      score: 0,
      explanation: explanation.into(),
      correction: correction.into(),
      natural_alternative: None,
    }
  }

  pub fn passes(&self, threshold: u8) -> bool {
    self.score >= threshold
  }
}

/// CEFR proficiency level.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProficiencyLevel {
  #[default]
  A1,
  A2,
  B1,
  B2,
  C1,
  C2,
}

/// Per-skill percentages, each within 0..=100.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SkillScores {
  pub speaking: u8,
  pub listening: u8,
  pub reading: u8,
  pub writing: u8,
}

impl SkillScores {
  pub fn get_mut(&mut self, skill: Skill) -> &mut u8 {
    match skill {
      Skill::Speaking => &mut self.speaking,
      Skill::Listening => &mut self.listening,
      Skill::Reading => &mut self.reading,
      Skill::Writing => &mut self.writing,
    }
  }
}

/// The slice of a learner's account this engine reads and produces.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
  pub id: String,
  #[serde(default)] pub level: ProficiencyLevel,
  #[serde(default)] pub xp: u64,
  #[serde(default)] pub streak: u32,
  #[serde(default)] pub completed_lessons: Vec<String>,
  #[serde(default)] pub skills: SkillScores,
}

impl UserRecord {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      level: ProficiencyLevel::A1,
      xp: 0,
      streak: 0,
      completed_lessons: Vec::new(),
      skills: SkillScores::default(),
    }
  }
}
