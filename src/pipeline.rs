use crate::apis::SymplaClient;
use crate::app::ports::HttpClientPort;
use crate::config::SymplaConfig;
use crate::error::{FetchFailure, ImporterError, Result};
use crate::metrics;
use crate::normalize;
use crate::storage::{EventTransaction, Storage, UpsertOutcome};
use crate::types::{BatchStatus, LoadBatch, LogEntry, LogLevel, RawEventData};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a complete import run
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub events_imported: u32,
    pub records_fetched: usize,
    pub records_skipped: usize,
    pub pages_fetched: usize,
    pub fetch_failure: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// State carried through one run, from batch creation to finalization
struct RunContext {
    batch: LoadBatch,
    imported: u32,
    skipped: usize,
    fetched: usize,
    pages: usize,
    fetch_failure: Option<FetchFailure>,
    logs: Vec<LogEntry>,
}

impl RunContext {
    fn new(batch: LoadBatch) -> Self {
        Self {
            batch,
            imported: 0,
            skipped: 0,
            fetched: 0,
            pages: 0,
            fetch_failure: None,
            logs: Vec::new(),
        }
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .push(LogEntry::new(level, message, Some(self.batch.id)));
    }
}

/// Fetches every Sympla page, validates each record and upserts it,
/// then closes the batch with a terminal status.
pub struct ImportPipeline {
    storage: Arc<dyn Storage>,
    http: Arc<dyn HttpClientPort>,
    sympla: SymplaConfig,
}

impl ImportPipeline {
    pub fn new(storage: Arc<dyn Storage>, http: Arc<dyn HttpClientPort>, sympla: SymplaConfig) -> Self {
        Self {
            storage,
            http,
            sympla,
        }
    }

    /// Run one import.
    ///
    /// Returns `Err` only when the batch row itself could not be created or
    /// finalized. Every other failure ends up in the summary with status ERROR.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ImportSummary> {
        let started = Instant::now();
        let batch = LoadBatch::start();
        self.storage.create_batch(&batch).await?;
        info!(batch_id = %batch.id, "Started load batch");

        let mut ctx = RunContext::new(batch);
        ctx.log(LogLevel::Info, "Sympla import started");

        let outcome = self.execute(&mut ctx, cancel).await;
        self.finalize(ctx, outcome, started).await
    }

    async fn execute(&self, ctx: &mut RunContext, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ImporterError::Cancelled);
        }

        let credentials = self.sympla.credentials()?;
        let client = SymplaClient::new(self.http.clone(), credentials);

        let report = client.fetch_events_until(cancel).await;
        ctx.pages = report.pages;
        ctx.fetched = report.records.len();
        if let Some(failure) = report.failure {
            ctx.log(
                LogLevel::Error,
                format!("Fetch stopped after {} page(s): {}", report.pages, failure),
            );
            ctx.fetch_failure = Some(failure);
        }
        if report.cancelled {
            return Err(ImporterError::Cancelled);
        }

        self.process_records(ctx, &report.records, cancel).await
    }

    #[instrument(skip_all, fields(batch_id = %ctx.batch.id, records = records.len()))]
    async fn process_records(
        &self,
        ctx: &mut RunContext,
        records: &[RawEventData],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tx = self.storage.begin_events().await?;

        for raw in records {
            if cancel.is_cancelled() {
                warn!("Import cancelled while processing records");
                Self::discard(tx).await;
                return Err(ImporterError::Cancelled);
            }

            let event = match normalize::validate(raw).and_then(|v| v.into_event(ctx.batch.id)) {
                Ok(event) => event,
                Err(failure) => {
                    warn!(
                        event_id = failure.event_id.as_deref().unwrap_or("<unknown>"),
                        field = failure.field,
                        "Skipping record: {}",
                        failure.reason
                    );
                    metrics::import::event_skipped(failure.field);
                    ctx.skipped += 1;
                    ctx.log(LogLevel::Warning, failure.to_string());
                    continue;
                }
            };

            match tx.upsert_event(&event).await {
                Ok(outcome) => {
                    ctx.imported += 1;
                    metrics::import::event_imported();
                    match outcome {
                        UpsertOutcome::Created => debug!(event_id = %event.event_id, "Event created"),
                        UpsertOutcome::Updated => debug!(event_id = %event.event_id, "Event updated"),
                    }
                }
                Err(e) => {
                    error!(event_id = %event.event_id, "Failed to persist event: {}", e);
                    Self::discard(tx).await;
                    return Err(e);
                }
            }
        }

        if cancel.is_cancelled() {
            warn!("Import cancelled before commit");
            Self::discard(tx).await;
            return Err(ImporterError::Cancelled);
        }
        tx.commit().await
    }

    async fn discard(tx: Box<dyn EventTransaction>) {
        if let Err(e) = tx.rollback().await {
            warn!("Rollback of event upserts failed: {}", e);
        }
    }

    async fn finalize(
        &self,
        mut ctx: RunContext,
        outcome: Result<()>,
        started: Instant,
    ) -> Result<ImportSummary> {
        let (status, run_error) = match outcome {
            Ok(()) => (BatchStatus::Success, None),
            Err(e) => {
                error!(batch_id = %ctx.batch.id, "Import failed: {}", e);
                ctx.log(LogLevel::Error, format!("Import failed: {e}"));
                (BatchStatus::Error, Some(e.to_string()))
            }
        };

        let imported = ctx.imported;
        ctx.batch.finish(status, imported)?;
        let finalized = self.storage.finalize_batch(&ctx.batch).await;

        let summary_level = match status {
            BatchStatus::Success => LogLevel::Info,
            _ => LogLevel::Error,
        };
        ctx.log(
            summary_level,
            format!(
                "Import finished as {}: {} imported, {} skipped, {} fetched",
                status.label(),
                ctx.imported,
                ctx.skipped,
                ctx.fetched
            ),
        );
        if let Err(e) = self.storage.append_logs(&ctx.logs).await {
            warn!(batch_id = %ctx.batch.id, "Failed to write import audit log: {}", e);
        }

        let elapsed = started.elapsed().as_secs_f64();
        metrics::import::batch_finished(status, elapsed);

        if let Err(e) = finalized {
            error!(batch_id = %ctx.batch.id, "Failed to finalize load batch: {}", e);
            return Err(e);
        }

        info!(
            batch_id = %ctx.batch.id,
            status = status.as_str(),
            imported = ctx.imported,
            skipped = ctx.skipped,
            elapsed_secs = elapsed,
            "Import finished"
        );
        let icon = if status == BatchStatus::Success { "✅" } else { "❌" };
        println!("{icon} {}", ctx.batch);
        println!(
            "   Events imported: {}  skipped: {}  fetched: {} ({} pages)",
            ctx.imported, ctx.skipped, ctx.fetched, ctx.pages
        );
        if let Some(failure) = &ctx.fetch_failure {
            println!("   Fetch stopped early: {failure}");
        }

        Ok(ImportSummary {
            batch_id: ctx.batch.id,
            status,
            events_imported: ctx.imported,
            records_fetched: ctx.fetched,
            records_skipped: ctx.skipped,
            pages_fetched: ctx.pages,
            fetch_failure: ctx.fetch_failure.map(|f| f.to_string()),
            error: run_error,
            started_at: ctx.batch.started_at,
            finished_at: ctx.batch.finished_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::ScriptedHttp;
    use crate::storage::InMemoryStorage;
    use crate::types::{Event, EventType};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "http://api.test/events";
    const PAGE2: &str = "http://api.test/events?page=2";

    fn sympla_config() -> SymplaConfig {
        SymplaConfig {
            base_url: Some(BASE.to_string()),
            token: Some("token".to_string()),
            timeout_seconds: 15,
        }
    }

    fn record(id: &str, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "start_date": "2025-10-20T20:00:00",
            "end_date": "2025-10-20T22:00:00",
            "address": null,
            "category_prim": {"name": "Music"},
            "category_sec": {"name": "Rock"}
        })
    }

    fn last_page(records: Vec<Value>) -> Value {
        json!({"data": records, "pagination": {"has_next": false}})
    }

    fn pipeline(storage: Arc<dyn Storage>, http: Arc<ScriptedHttp>) -> ImportPipeline {
        ImportPipeline::new(storage, http, sympla_config())
    }

    async fn run(storage: Arc<dyn Storage>, http: Arc<ScriptedHttp>) -> ImportSummary {
        pipeline(storage, http)
            .run(&CancellationToken::new())
            .await
            .unwrap()
    }

    /// Storage whose transactions fail on the n-th upsert (1-based)
    struct FailingStorage {
        inner: InMemoryStorage,
        fail_on: usize,
    }

    struct FailingTransaction {
        inner: Box<dyn EventTransaction>,
        seen: Arc<AtomicUsize>,
        fail_on: usize,
    }

    #[async_trait]
    impl Storage for FailingStorage {
        async fn create_batch(&self, batch: &LoadBatch) -> Result<()> {
            self.inner.create_batch(batch).await
        }
        async fn finalize_batch(&self, batch: &LoadBatch) -> Result<()> {
            self.inner.finalize_batch(batch).await
        }
        async fn get_batch(&self, batch_id: Uuid) -> Result<Option<LoadBatch>> {
            self.inner.get_batch(batch_id).await
        }
        async fn list_batches(&self, limit: usize) -> Result<Vec<LoadBatch>> {
            self.inner.list_batches(limit).await
        }
        async fn begin_events(&self) -> Result<Box<dyn EventTransaction>> {
            Ok(Box::new(FailingTransaction {
                inner: self.inner.begin_events().await?,
                seen: Arc::new(AtomicUsize::new(0)),
                fail_on: self.fail_on,
            }))
        }
        async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
            self.inner.get_event(event_id).await
        }
        async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<Event>> {
            self.inner.list_events(limit, offset).await
        }
        async fn count_events(&self) -> Result<usize> {
            self.inner.count_events().await
        }
        async fn append_logs(&self, entries: &[LogEntry]) -> Result<()> {
            self.inner.append_logs(entries).await
        }
        async fn list_logs(&self, batch_id: Option<Uuid>) -> Result<Vec<LogEntry>> {
            self.inner.list_logs(batch_id).await
        }
    }

    #[async_trait]
    impl EventTransaction for FailingTransaction {
        async fn upsert_event(&mut self, event: &Event) -> Result<UpsertOutcome> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(ImporterError::Database {
                    message: "disk I/O error".to_string(),
                });
            }
            self.inner.upsert_event(event).await
        }
        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> Result<()> {
            self.inner.rollback().await
        }
    }

    #[tokio::test]
    async fn test_end_to_end_presential_event() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(ScriptedHttp::new().json(
            BASE,
            last_page(vec![json!({
                "id": "evt1",
                "name": "A",
                "start_date": "2025-10-20T20:00:00",
                "end_date": "2025-10-20T22:00:00",
                "address": {"name": "Hall", "city": "Recife"},
                "category_prim": {"name": "Music"},
                "category_sec": {"name": "Rock"}
            })]),
        ));

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.events_imported, 1);
        assert!(summary.finished_at.is_some());

        let event = storage.get_event("evt1").await.unwrap().unwrap();
        assert_eq!(event.event_type, EventType::Presential);
        assert_eq!(event.city.as_deref(), Some("Recife"));
        assert_eq!(event.venue_name.as_deref(), Some("Hall"));
        assert_eq!(event.load_batch, summary.batch_id);

        let batch = storage.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Success);
        assert_eq!(batch.events_imported_count, 1);
        assert!(batch.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_reimport_is_idempotent_and_moves_batch() {
        let storage = Arc::new(InMemoryStorage::new());
        let first = run(
            storage.clone(),
            Arc::new(ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "Old name")]))),
        )
        .await;
        let second = run(
            storage.clone(),
            Arc::new(ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "New name")]))),
        )
        .await;

        assert_ne!(first.batch_id, second.batch_id);
        assert_eq!(storage.count_events().await.unwrap(), 1);
        let event = storage.get_event("evt1").await.unwrap().unwrap();
        assert_eq!(event.name, "New name");
        assert_eq!(event.load_batch, second.batch_id);
    }

    #[tokio::test]
    async fn test_partial_page_failure_keeps_first_page() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(
            ScriptedHttp::new()
                .json(
                    BASE,
                    json!({
                        "data": [record("evt1", "A")],
                        "pagination": {"has_next": true, "next_page_url": PAGE2}
                    }),
                )
                .failure(
                    PAGE2,
                    FetchFailure::Timeout {
                        url: PAGE2.to_string(),
                    },
                ),
        );

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.events_imported, 1);
        assert_eq!(summary.pages_fetched, 1);
        assert!(summary.fetch_failure.is_some());
        assert!(storage.get_event("evt1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_http_error_on_first_page_is_empty_success() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(ScriptedHttp::new().failure(
            BASE,
            FetchFailure::HttpError {
                url: BASE.to_string(),
                status: 500,
            },
        ));

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.events_imported, 0);
        assert_eq!(summary.records_fetched, 0);
        assert!(summary.fetch_failure.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_invalid_record_is_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut broken = record("evt2", "B");
        broken.as_object_mut().unwrap().remove("name");
        let http = Arc::new(
            ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "A"), broken])),
        );

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.events_imported, 1);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(storage.count_events().await.unwrap(), 1);

        let logs = storage.list_logs(Some(summary.batch_id)).await.unwrap();
        let warnings: Vec<_> = logs.iter().filter(|l| l.level == LogLevel::Warning).collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("evt2"));
    }

    #[tokio::test]
    async fn test_category_without_name_is_skipped() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut nameless = record("evt2", "B");
        nameless["category_sec"] = json!({"id": 7});
        let mut plain = record("evt3", "C");
        plain["category_prim"] = json!("Theatre");
        let http = Arc::new(ScriptedHttp::new().json(
            BASE,
            last_page(vec![record("evt1", "A"), nameless, plain]),
        ));

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.events_imported, 2);
        assert_eq!(summary.records_skipped, 1);
        assert!(storage.get_event("evt2").await.unwrap().is_none());
        let plain = storage.get_event("evt3").await.unwrap().unwrap();
        assert_eq!(plain.category, "Theatre");
    }

    #[tokio::test]
    async fn test_online_event_without_address() {
        let storage = Arc::new(InMemoryStorage::new());
        let mut empty_address = record("evt2", "B");
        empty_address["address"] = json!({"name": "", "city": null});
        let http = Arc::new(ScriptedHttp::new().json(
            BASE,
            last_page(vec![record("evt1", "A"), empty_address]),
        ));

        run(storage.clone(), http).await;
        for id in ["evt1", "evt2"] {
            let event = storage.get_event(id).await.unwrap().unwrap();
            assert_eq!(event.event_type, EventType::Online);
            assert!(event.venue_name.is_none());
            assert!(event.city.is_none());
        }
    }

    #[tokio::test]
    async fn test_duplicate_across_pages_last_wins() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(
            ScriptedHttp::new()
                .json(
                    BASE,
                    json!({
                        "data": [record("evt1", "First")],
                        "pagination": {"has_next": true, "next_page_url": PAGE2}
                    }),
                )
                .json(PAGE2, last_page(vec![record("evt1", "Second")])),
        );

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.events_imported, 2);
        assert_eq!(storage.count_events().await.unwrap(), 1);
        assert_eq!(storage.get_event("evt1").await.unwrap().unwrap().name, "Second");
    }

    #[tokio::test]
    async fn test_missing_token_finalizes_as_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(ScriptedHttp::new());
        let config = SymplaConfig {
            token: None,
            ..sympla_config()
        };

        let summary = ImportPipeline::new(storage.clone(), http.clone(), config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.status, BatchStatus::Error);
        assert_eq!(summary.events_imported, 0);
        assert!(summary.error.unwrap().contains("SYMPLA_API_TOKEN"));
        assert_eq!(http.call_count(), 0);

        let batch = storage.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert!(batch.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_rolls_back_and_errors() {
        let storage = Arc::new(FailingStorage {
            inner: InMemoryStorage::new(),
            fail_on: 2,
        });
        let http = Arc::new(ScriptedHttp::new().json(
            BASE,
            last_page(vec![record("evt1", "A"), record("evt2", "B"), record("evt3", "C")]),
        ));

        let summary = run(storage.clone(), http).await;
        assert_eq!(summary.status, BatchStatus::Error);
        assert_eq!(summary.events_imported, 1);
        assert_eq!(storage.count_events().await.unwrap(), 0);

        let batch = storage.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.events_imported_count, 1);
        assert!(batch.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_finalizes_as_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "A")])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = pipeline(storage.clone(), http.clone())
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, BatchStatus::Error);
        assert_eq!(http.call_count(), 0);
        assert_eq!(storage.count_events().await.unwrap(), 0);
        let batch = storage.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
    }

    /// Port that cancels the run while serving the only page
    struct CancellingHttp {
        inner: ScriptedHttp,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl HttpClientPort for CancellingHttp {
        async fn get(
            &self,
            url: &str,
            headers: &[(&str, &str)],
        ) -> std::result::Result<crate::app::ports::HttpGetResult, FetchFailure> {
            self.cancel.cancel();
            self.inner.get(url, headers).await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_persists_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let cancel = CancellationToken::new();
        let http = Arc::new(CancellingHttp {
            inner: ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "A")])),
            cancel: cancel.clone(),
        });

        let summary = ImportPipeline::new(storage.clone(), http, sympla_config())
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, BatchStatus::Error);
        assert_eq!(summary.events_imported, 0);
        assert_eq!(storage.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_empty_last_page_is_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let cancel = CancellationToken::new();
        let http = Arc::new(CancellingHttp {
            inner: ScriptedHttp::new().json(BASE, last_page(vec![])),
            cancel: cancel.clone(),
        });

        let summary = ImportPipeline::new(storage.clone(), http, sympla_config())
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(summary.status, BatchStatus::Error);
        let batch = storage.get_batch(summary.batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert!(batch.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_audit_log_written_after_run() {
        let storage = Arc::new(InMemoryStorage::new());
        let http = Arc::new(ScriptedHttp::new().json(BASE, last_page(vec![record("evt1", "A")])));

        let summary = run(storage.clone(), http).await;
        let logs = storage.list_logs(Some(summary.batch_id)).await.unwrap();
        assert!(logs.len() >= 2);
        assert_eq!(logs.first().unwrap().level, LogLevel::Info);
        assert!(logs.last().unwrap().message.contains("Sucesso"));
    }
}
