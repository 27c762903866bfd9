use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::job::JobRequest;

/// A job request that was given up on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub request: JobRequest,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(request: JobRequest, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Parking lot for requests that need a human look.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Store an entry. Storing the same entry id twice keeps the first.
    async fn dead_letter(&self, entry: DeadLetterEntry) -> anyhow::Result<()>;

    async fn list(&self) -> anyhow::Result<Vec<DeadLetterEntry>>;

    /// Remove and return an entry, typically to redrive it.
    async fn take(&self, id: Uuid) -> anyhow::Result<Option<DeadLetterEntry>>;
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Arc<Mutex<BTreeMap<Uuid, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryDeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryDeadLetterSink");
        match self.entries.try_lock() {
            Ok(entries) => debug.field("entries", &entries.len()),
            Err(_) => debug.field("entries", &"<locked>"),
        };
        debug.finish()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(&self, entry: DeadLetterEntry) -> anyhow::Result<()> {
        self.entries.lock().await.entry(entry.id).or_insert(entry);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        // v7 ids sort by creation time
        Ok(self.entries.lock().await.values().cloned().collect())
    }

    async fn take(&self, id: Uuid) -> anyhow::Result<Option<DeadLetterEntry>> {
        Ok(self.entries.lock().await.remove(&id))
    }
}
