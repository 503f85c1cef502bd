//! Message persistence capability.
//!
//! The engine treats storage as advisory: reads that fail degrade to "no
//! prior history" and writes are fire-and-forget, so persistence lag never
//! blocks a generation.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Message;

/// Errors from the persistence capability.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Asynchronous read/write of a project's stored message list.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Loads the stored messages for a project, `None` if none were saved.
    async fn load(&self, project_id: &str) -> Result<Option<Vec<Message>>, StoreError>;

    /// Replaces the stored messages for a project.
    async fn save(&self, project_id: &str, messages: &[Message]) -> Result<(), StoreError>;
}

/// On-disk record for one project's conversation.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    project_id: String,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

/// File-backed store: one JSON record per project id.
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    dir: PathBuf,
}

impl FileMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(project_id)))
    }
}

/// Maps a project id onto a path-safe file stem.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn load(&self, project_id: &str) -> Result<Option<Vec<Message>>, StoreError> {
        let path = self.record_path(project_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: SessionRecord = serde_json::from_slice(&bytes)?;
        Ok(Some(record.messages))
    }

    async fn save(&self, project_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let record = SessionRecord {
            project_id: project_id.to_string(),
            updated_at: Utc::now(),
            messages: messages.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(self.record_path(project_id), json).await?;
        Ok(())
    }
}
