//! Folding a finished session's outcomes into the learner's record.

use std::collections::BTreeSet;

use crate::domain::{Task, UserRecord};

pub const MAX_SKILL: u8 = 100;

/// Final verdict per task, in task order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
  Passed,
  Failed,
}

/// Sum of `xp_reward` over passed tasks.
pub fn earned_xp<'a>(outcomes: impl IntoIterator<Item = (&'a Task, TaskOutcome)>) -> u64 {
  outcomes
    .into_iter()
    .filter(|(_, o)| *o == TaskOutcome::Passed)
    .map(|(t, _)| u64::from(t.xp_reward))
    .sum()
}

/// Produce the updated record for a completed lesson. Every distinct skill
/// touched by at least one passed task gains `step` (capped at 100), XP grows by
/// the earned rewards, and the lesson is listed as completed once.
pub fn aggregate(
  user: &UserRecord,
  lesson_id: &str,
  outcomes: &[(&Task, TaskOutcome)],
  step: u8,
) -> UserRecord {
  let mut updated = user.clone();

  updated.xp = updated.xp.saturating_add(earned_xp(outcomes.iter().copied()));

  let touched: BTreeSet<_> = outcomes
    .iter()
    .filter(|(_, o)| *o == TaskOutcome::Passed)
    .map(|(t, _)| t.skill_impact)
    .collect();
  for skill in touched {
    let value = updated.skills.get_mut(skill);
    *value = value.saturating_add(step).min(MAX_SKILL);
  }

  if !updated.completed_lessons.iter().any(|l| l == lesson_id) {
    updated.completed_lessons.push(lesson_id.to_string());
  }
  updated
}
