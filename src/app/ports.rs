use crate::error::FetchFailure;
use async_trait::async_trait;

// Ingest-side ports
#[async_trait]
pub trait HttpClientPort: Send + Sync {
    /// Issue a GET with the given extra headers. Non-2xx statuses are returned, not raised.
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpGetResult, FetchFailure>;
}

#[derive(Clone, Debug)]
pub struct HttpGetResult {
    pub status: u16,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl HttpGetResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
