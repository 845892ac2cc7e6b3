//! Checkpoint store: which task index is active for a (user, lesson) pair.
//!
//! Entries are nested per user and then per lesson, so two users working on the
//! same lesson never share a slot. Only the owning session writes its entry.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::StoreError;

type Checkpoints = HashMap<String, HashMap<String, usize>>;

#[async_trait]
pub trait ProgressStore: Send + Sync {
  async fn save(&self, user_id: &str, lesson_id: &str, index: usize) -> Result<(), StoreError>;
  async fn load(&self, user_id: &str, lesson_id: &str) -> Result<Option<usize>, StoreError>;
  async fn clear(&self, user_id: &str, lesson_id: &str) -> Result<(), StoreError>;
}

/// Process-local store. Checkpoints survive session teardown but not a restart.
#[derive(Default)]
pub struct InMemoryProgressStore {
  entries: RwLock<Checkpoints>,
}

impl InMemoryProgressStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
  async fn save(&self, user_id: &str, lesson_id: &str, index: usize) -> Result<(), StoreError> {
    let mut entries = self.entries.write().await;
    entries.entry(user_id.to_string()).or_default().insert(lesson_id.to_string(), index);
    Ok(())
  }

  async fn load(&self, user_id: &str, lesson_id: &str) -> Result<Option<usize>, StoreError> {
    let entries = self.entries.read().await;
    Ok(entries.get(user_id).and_then(|lessons| lessons.get(lesson_id)).copied())
  }

  async fn clear(&self, user_id: &str, lesson_id: &str) -> Result<(), StoreError> {
    let mut entries = self.entries.write().await;
    remove_entry(&mut entries, user_id, lesson_id);
    Ok(())
  }
}

/// JSON document on disk, rewritten whole on every change (temp file + rename).
pub struct FileProgressStore {
  path: PathBuf,
  entries: Mutex<Checkpoints>,
}

impl FileProgressStore {
  /// Open (or create on first write) the checkpoint file at `path`.
  #[instrument(level = "info", skip_all, fields(path = %path.display()))]
  pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
    let entries = match tokio::fs::read_to_string(&path).await {
      Ok(s) if s.trim().is_empty() => Checkpoints::new(),
      Ok(s) => serde_json::from_str::<Checkpoints>(&s)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Checkpoints::new(),
      Err(e) => return Err(e.into()),
    };
    info!(target: "progress", users = entries.len(), "Checkpoint file opened");
    Ok(Self { path, entries: Mutex::new(entries) })
  }

  async fn flush(&self, entries: &Checkpoints) -> Result<(), StoreError> {
    let body = serde_json::to_string_pretty(entries)?;
    let tmp = self.path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &self.path).await?;
    debug!(target: "progress", path = %self.path.display(), "Checkpoint file written");
    Ok(())
  }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
  async fn save(&self, user_id: &str, lesson_id: &str, index: usize) -> Result<(), StoreError> {
    let mut entries = self.entries.lock().await;
    entries.entry(user_id.to_string()).or_default().insert(lesson_id.to_string(), index);
    self.flush(&entries).await
  }

  async fn load(&self, user_id: &str, lesson_id: &str) -> Result<Option<usize>, StoreError> {
    let entries = self.entries.lock().await;
    Ok(entries.get(user_id).and_then(|lessons| lessons.get(lesson_id)).copied())
  }

  async fn clear(&self, user_id: &str, lesson_id: &str) -> Result<(), StoreError> {
    let mut entries = self.entries.lock().await;
    if remove_entry(&mut entries, user_id, lesson_id) {
      self.flush(&entries).await?;
    }
    Ok(())
  }
}

fn remove_entry(entries: &mut Checkpoints, user_id: &str, lesson_id: &str) -> bool {
  let Some(lessons) = entries.get_mut(user_id) else { return false };
  let removed = lessons.remove(lesson_id).is_some();
  if lessons.is_empty() {
    entries.remove(user_id);
  }
  removed
}
