use crate::error::{ImporterError, Result};
use crate::types::{Event, LoadBatch, LogEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// What an upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Storage trait for events, import batches and the audit log
#[async_trait]
pub trait Storage: Send + Sync {
    // Batch operations
    async fn create_batch(&self, batch: &LoadBatch) -> Result<()>;
    /// Persist the terminal state of a batch. Rejects non-terminal and already-terminal batches.
    async fn finalize_batch(&self, batch: &LoadBatch) -> Result<()>;
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<LoadBatch>>;
    async fn list_batches(&self, limit: usize) -> Result<Vec<LoadBatch>>;

    // Event operations
    /// Open a unit of work for event upserts; nothing is visible to readers until commit.
    async fn begin_events(&self) -> Result<Box<dyn EventTransaction>>;
    async fn get_event(&self, event_id: &str) -> Result<Option<Event>>;
    /// Events ordered by start date, newest first
    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>>;
    async fn count_events(&self) -> Result<usize>;

    // Audit log operations
    async fn append_logs(&self, entries: &[LogEntry]) -> Result<()>;
    async fn list_logs(&self, batch_id: Option<Uuid>) -> Result<Vec<LogEntry>>;
}

/// Group of event upserts applied atomically
#[async_trait]
pub trait EventTransaction: Send {
    /// Create or replace the event keyed by `event_id`; last write wins.
    async fn upsert_event(&mut self, event: &Event) -> Result<UpsertOutcome>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Shared ordering for event listings
pub(crate) fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.start_date
            .cmp(&a.start_date)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| ImporterError::Database {
        message: "in-memory storage lock poisoned".to_string(),
    })
}

#[derive(Default)]
struct EventTable {
    rows: HashMap<String, Event>,
    next_id: i64,
}

/// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    events: Arc<Mutex<EventTable>>,
    batches: Arc<Mutex<HashMap<Uuid, LoadBatch>>>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_batch(&self, batch: &LoadBatch) -> Result<()> {
        let mut batches = lock(&self.batches)?;
        if batches.contains_key(&batch.id) {
            return Err(ImporterError::Batch {
                message: format!("batch {} already exists", batch.id),
            });
        }
        batches.insert(batch.id, batch.clone());
        debug!("Created load batch {}", batch.id);
        Ok(())
    }

    async fn finalize_batch(&self, batch: &LoadBatch) -> Result<()> {
        if !batch.status.is_terminal() || batch.finished_at.is_none() {
            return Err(ImporterError::Batch {
                message: format!("batch {} is not finished", batch.id),
            });
        }
        let mut batches = lock(&self.batches)?;
        let stored = batches.get_mut(&batch.id).ok_or_else(|| ImporterError::Batch {
            message: format!("batch {} does not exist", batch.id),
        })?;
        if stored.status.is_terminal() {
            return Err(ImporterError::Batch {
                message: format!("batch {} already finished as {}", batch.id, stored.status),
            });
        }
        stored.status = batch.status;
        stored.finished_at = batch.finished_at;
        stored.events_imported_count = batch.events_imported_count;
        debug!("Finalized load batch {} as {}", batch.id, batch.status);
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<LoadBatch>> {
        Ok(lock(&self.batches)?.get(&batch_id).cloned())
    }

    async fn list_batches(&self, limit: usize) -> Result<Vec<LoadBatch>> {
        let mut batches: Vec<LoadBatch> = lock(&self.batches)?.values().cloned().collect();
        batches.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn begin_events(&self) -> Result<Box<dyn EventTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            table: self.events.clone(),
            staged: Vec::new(),
        }))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(lock(&self.events)?.rows.get(event_id).cloned())
    }

    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = lock(&self.events)?.rows.values().cloned().collect();
        sort_events(&mut events);
        Ok(events.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_events(&self) -> Result<usize> {
        Ok(lock(&self.events)?.rows.len())
    }

    async fn append_logs(&self, entries: &[LogEntry]) -> Result<()> {
        lock(&self.logs)?.extend(entries.iter().cloned());
        Ok(())
    }

    async fn list_logs(&self, batch_id: Option<Uuid>) -> Result<Vec<LogEntry>> {
        let logs = lock(&self.logs)?;
        Ok(logs
            .iter()
            .filter(|entry| batch_id.map_or(true, |id| entry.batch_id == Some(id)))
            .cloned()
            .collect())
    }
}

/// Stages upserts in arrival order and applies them under one lock on commit
struct InMemoryTransaction {
    table: Arc<Mutex<EventTable>>,
    staged: Vec<Event>,
}

#[async_trait]
impl EventTransaction for InMemoryTransaction {
    async fn upsert_event(&mut self, event: &Event) -> Result<UpsertOutcome> {
        let exists = self.staged.iter().any(|e| e.event_id == event.event_id)
            || lock(&self.table)?.rows.contains_key(&event.event_id);
        self.staged.push(event.clone());
        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction { table, staged } = *self;
        let mut rows = lock(&table)?;
        let staged_count = staged.len();
        for mut event in staged {
            let existing_id = rows.rows.get(&event.event_id).and_then(|e| e.id);
            event.id = match existing_id {
                Some(id) => Some(id),
                None => {
                    rows.next_id += 1;
                    Some(rows.next_id)
                }
            };
            rows.rows.insert(event.event_id.clone(), event);
        }
        debug!("Committed {} staged event upserts", staged_count);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Discarded {} staged event upserts", self.staged.len());
        Ok(())
    }
}
