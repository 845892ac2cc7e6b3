//! User record port. The engine only reads a learner's record when a session
//! starts and hands back one updated record when the lesson completes.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::UserRecord;
use crate::error::StoreError;

#[async_trait]
pub trait UserRecordSink: Send + Sync {
  async fn load(&self, user_id: &str) -> Result<UserRecord, StoreError>;
  async fn save(&self, record: UserRecord) -> Result<(), StoreError>;
}

/// In-memory account table. Unknown users get a fresh A1 record on first load.
#[derive(Default)]
pub struct InMemoryUserStore {
  records: RwLock<HashMap<String, UserRecord>>,
}

impl InMemoryUserStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl UserRecordSink for InMemoryUserStore {
  async fn load(&self, user_id: &str) -> Result<UserRecord, StoreError> {
    if let Some(record) = self.records.read().await.get(user_id) {
      return Ok(record.clone());
    }
    let mut records = self.records.write().await;
    let record = records
      .entry(user_id.to_string())
      .or_insert_with(|| {
        info!(target: "lingualeap_backend", %user_id, "Created default user record");
        UserRecord::new(user_id)
      })
      .clone();
    Ok(record)
  }

  async fn save(&self, record: UserRecord) -> Result<(), StoreError> {
    self.records.write().await.insert(record.id.clone(), record);
    Ok(())
  }
}
