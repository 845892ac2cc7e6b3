//! Built-in lesson content that guarantees the app is usable without external config.

use crate::domain::{Skill, Task, TaskKind};

pub const GREETINGS_LESSON_ID: &str = "a1-1";

fn task(id: &str, kind: TaskKind, prompt: &str, target: &str, xp: u32, skill: Skill) -> Task {
  Task {
    id: id.into(),
    kind,
    prompt: prompt.into(),
    target_text: Some(target.into()),
    xp_reward: xp,
    skill_impact: skill,
  }
}

fn reading(options: &[&str]) -> TaskKind {
  TaskKind::Reading { options: options.iter().map(|o| o.to_string()).collect() }
}

fn listening(audio_text: &str) -> TaskKind {
  TaskKind::Listening { audio_text: audio_text.into() }
}

/// A1 "Greetings & Introductions": fifteen tasks cycling through all four skills.
pub fn greetings_lesson() -> Vec<Task> {
  use Skill::*;
  vec![
    task("t1", TaskKind::Writing, "How do you say 'hello' formally at 8:00 AM?", "Good morning", 10, Writing),
    task("t2", TaskKind::Speaking, "Repeat clearly: 'Hi, my name is Alex. Nice to meet you.'", "Hi, my name is Alex. Nice to meet you.", 20, Speaking),
    task(
      "t3",
      reading(&["I am 20 years old.", "I'm fine, thanks. And you?", "My name is John.", "I'm from London."]),
      "Which of these is the most appropriate response to 'How are you?'",
      "I'm fine, thanks. And you?",
      10,
      Reading,
    ),
    task("t4", listening("My name is Maria. M-A-R-I-A."), "Listen and write the name you hear spelled.", "Maria", 15, Listening),
    task("t5", TaskKind::Writing, "Complete the sentence: 'Nice to ____ you.'", "meet", 10, Writing),
    task("t6", TaskKind::Speaking, "Say where you are from: 'I am from Brazil and I live in São Paulo.'", "I am from Brazil and I live in São Paulo.", 20, Speaking),
    task(
      "t7",
      reading(&["What's up?", "Hey!", "Good afternoon", "Hi there"]),
      "Choose the formal greeting used for a business meeting in the afternoon (3:00 PM).",
      "Good afternoon",
      10,
      Reading,
    ),
    task("t8", listening("I have twenty-five students in my English class."), "Write the number you hear mentioned in the audio.", "25", 15, Listening),
    task("t9", TaskKind::Writing, "Translate to English: 'Como você está?'", "How are you?", 15, Writing),
    task("t10", TaskKind::Speaking, "Say goodbye politely: 'See you later! Have a nice day.'", "See you later! Have a nice day.", 20, Speaking),
    task(
      "t11",
      reading(&["1-2-3", "2-3-1", "3-2-1", "2-1-3"]),
      "Put the conversation in order: (1) Nice to meet you too. (2) Hello, I'm Sarah. (3) Hi Sarah, I'm Paul. Nice to meet you.",
      "2-3-1",
      15,
      Reading,
    ),
    task("t12", TaskKind::Writing, "Fill in the blank: 'I ___ a student at Fluent Academy.'", "am", 10, Writing),
    task("t13", TaskKind::Speaking, "Practice emphasis: 'I am VERY happy to be here today!'", "I am VERY happy to be here today!", 25, Speaking),
    task("t14", listening("I want to visit New York City next summer."), "Listen and write the city name.", "New York", 15, Listening),
    task("t15", TaskKind::Writing, "Introduce your friend Sarah to your teacher: 'Teacher, this is...'", "my friend Sarah", 20, Writing),
  ]
}
