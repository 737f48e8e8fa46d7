use crate::error::{ImporterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Raw event data as returned by the Sympla API
pub type RawEventData = serde_json::Value;

/// Whether an event happens at a physical venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Presential,
    Online,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Presential => "PRESENTIAL",
            EventType::Online => "ONLINE",
        }
    }

    /// Human readable label shown to Sympla users
    pub fn label(&self) -> &'static str {
        match self {
            EventType::Presential => "Presencial",
            EventType::Online => "Online",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ImporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PRESENTIAL" => Ok(EventType::Presential),
            "ONLINE" => Ok(EventType::Online),
            other => Err(ImporterError::Database {
                message: format!("unknown event type '{other}'"),
            }),
        }
    }
}

/// An event imported from Sympla, unique on `event_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub event_id: String,
    pub name: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub venue_name: Option<String>,
    pub city: Option<String>,
    pub category: String,
    pub sub_category: String,
    /// Batch that last wrote this event
    pub load_batch: Uuid,
    pub event_type: EventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Success,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Success => "SUCCESS",
            BatchStatus::Error => "ERROR",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "Pendente",
            BatchStatus::Success => "Sucesso",
            BatchStatus::Error => "Error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ImporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(BatchStatus::Pending),
            "SUCCESS" => Ok(BatchStatus::Success),
            "ERROR" => Ok(BatchStatus::Error),
            other => Err(ImporterError::Database {
                message: format!("unknown batch status '{other}'"),
            }),
        }
    }
}

/// One import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBatch {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub events_imported_count: u32,
}

impl LoadBatch {
    /// Create a new pending batch
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: BatchStatus::Pending,
            events_imported_count: 0,
        }
    }

    /// Move the batch to its terminal status. Allowed exactly once.
    pub fn finish(&mut self, status: BatchStatus, events_imported_count: u32) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ImporterError::Batch {
                message: format!("batch {} already finished as {}", self.id, self.status),
            });
        }
        if !status.is_terminal() {
            return Err(ImporterError::Batch {
                message: format!("batch {} cannot finish as {}", self.id, status),
            });
        }
        self.status = status;
        self.events_imported_count = events_imported_count;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

impl fmt::Display for LoadBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoadBatch: {} - {}", self.id, self.status.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ImporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(ImporterError::Database {
                message: format!("unknown log level '{other}'"),
            }),
        }
    }
}

/// Audit trail row, optionally tied to a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub batch_id: Option<Uuid>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, batch_id: Option<Uuid>) -> Self {
        Self {
            level,
            message: message.into(),
            created_at: Utc::now(),
            batch_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_finishes_exactly_once() {
        let mut batch = LoadBatch::start();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(batch.finished_at.is_none());

        batch.finish(BatchStatus::Success, 3).unwrap();
        assert_eq!(batch.status, BatchStatus::Success);
        assert_eq!(batch.events_imported_count, 3);
        assert!(batch.finished_at.unwrap() >= batch.started_at);

        let again = batch.finish(BatchStatus::Error, 0);
        assert!(matches!(again, Err(ImporterError::Batch { .. })));
        assert_eq!(batch.status, BatchStatus::Success);
    }

    #[test]
    fn test_batch_cannot_finish_as_pending() {
        let mut batch = LoadBatch::start();
        assert!(batch.finish(BatchStatus::Pending, 0).is_err());
        assert!(batch.finished_at.is_none());
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&EventType::Presential).unwrap(), "\"PRESENTIAL\"");
        assert_eq!(serde_json::to_string(&BatchStatus::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!("ONLINE".parse::<EventType>().unwrap(), EventType::Online);
        assert_eq!("ERROR".parse::<BatchStatus>().unwrap(), BatchStatus::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("Sucesso".parse::<BatchStatus>().is_err());
    }
}
