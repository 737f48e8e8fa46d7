use crate::app::ports::HttpClientPort;
use crate::config::SymplaCredentials;
use crate::constants::SYMPLA_TOKEN_HEADER;
use crate::error::FetchFailure;
use crate::metrics;
use crate::types::RawEventData;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One decoded page of the Sympla events listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<RawEventData>,
    pub next_url: Option<String>,
}

/// Everything a pagination traversal produced, including why it stopped early
#[derive(Debug, Default)]
pub struct FetchReport {
    pub records: Vec<RawEventData>,
    pub pages: usize,
    pub failure: Option<FetchFailure>,
    pub cancelled: bool,
}

/// Talks to the paginated Sympla events endpoint
pub struct SymplaClient {
    http: Arc<dyn HttpClientPort>,
    credentials: SymplaCredentials,
}

impl SymplaClient {
    pub fn new(http: Arc<dyn HttpClientPort>, credentials: SymplaCredentials) -> Self {
        Self { http, credentials }
    }

    /// Fetch and decode a single page.
    #[instrument(skip(self))]
    pub async fn fetch_page(&self, url: &str) -> Result<Page, FetchFailure> {
        let headers = [(SYMPLA_TOKEN_HEADER, self.credentials.token.as_str())];
        let response = self.http.get(url, &headers).await?;
        if !response.is_success() {
            return Err(FetchFailure::HttpError {
                url: url.to_string(),
                status: response.status,
            });
        }
        Self::parse_page(url, &response.bytes).map_err(|failure| match failure {
            FetchFailure::InvalidBody { url, message } => FetchFailure::InvalidBody {
                url,
                message: format!("{} (content-type {})", message, response.content_type),
            },
            other => other,
        })
    }

    /// Decode `{ data: [...], pagination: { has_next, next_page_url } }`.
    pub fn parse_page(url: &str, bytes: &[u8]) -> Result<Page, FetchFailure> {
        let body: Value = serde_json::from_slice(bytes).map_err(|e| FetchFailure::InvalidBody {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let records = match body.get("data") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(FetchFailure::InvalidBody {
                    url: url.to_string(),
                    message: "'data' is not an array".to_string(),
                })
            }
        };

        Ok(Page {
            records,
            next_url: Self::next_page_url(&body),
        })
    }

    fn next_page_url(body: &Value) -> Option<String> {
        let pagination = body.get("pagination")?;
        if !pagination.get("has_next").map_or(false, truthy) {
            return None;
        }
        pagination
            .get("next_page_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
    }

    /// Walk every page starting at the base URL.
    pub async fn fetch_events(&self) -> FetchReport {
        self.fetch_events_until(&CancellationToken::new()).await
    }

    /// Walk every page until the source is exhausted, a fetch fails, or `cancel` fires.
    ///
    /// Records from pages fetched before a failure are kept in the report.
    #[instrument(skip(self, cancel), fields(base_url = %self.credentials.base_url))]
    pub async fn fetch_events_until(&self, cancel: &CancellationToken) -> FetchReport {
        let mut report = FetchReport::default();
        let mut visited = HashSet::new();
        let mut next_url = Some(self.credentials.base_url.clone());

        while let Some(url) = next_url.take() {
            if !visited.insert(url.clone()) {
                warn!(url = %url, "Pagination loops back to an already fetched page, stopping");
                break;
            }

            info!(url = %url, "Fetching events from URL");
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(url = %url, "Fetch cancelled");
                    report.cancelled = true;
                    break;
                }
                fetched = self.fetch_page(&url) => fetched,
            };

            match fetched {
                Ok(page) => {
                    debug!(url = %url, records = page.records.len(), "Page fetched");
                    metrics::sympla::page_fetched(page.records.len());
                    report.pages += 1;
                    report.records.extend(page.records);
                    next_url = page.next_url;
                }
                Err(failure) => {
                    Self::log_failure(&failure);
                    metrics::sympla::fetch_failed(failure.kind());
                    report.failure = Some(failure);
                    break;
                }
            }
        }

        info!("Total of {} events found in Sympla API.", report.records.len());
        report
    }

    fn log_failure(failure: &FetchFailure) {
        let url = failure.url();
        match failure {
            FetchFailure::Timeout { .. } => {
                error!(url, "Timeout on request to Sympla API");
            }
            FetchFailure::HttpError { status, .. } => {
                error!(url, status = *status, "HTTP error accessing Sympla API");
            }
            FetchFailure::Network { message, .. } => {
                error!(url, "Communication error with Sympla API: {}", message);
            }
            FetchFailure::InvalidBody { message, .. } => {
                error!(url, "Unreadable response from Sympla API: {}", message);
            }
        }
    }
}

/// Loose truthiness for flags the API does not always send as booleans:
/// null, false, zero and empty strings or collections are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
