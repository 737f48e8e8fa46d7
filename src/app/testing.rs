use crate::app::ports::{HttpClientPort, HttpGetResult};
use crate::error::FetchFailure;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// HTTP port that answers from a per-URL script and records every request
pub struct ScriptedHttp {
    responses: Mutex<HashMap<String, VecDeque<Result<HttpGetResult, FetchFailure>>>>,
    pub calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn json(self, url: &str, body: Value) -> Self {
        self.respond(url, Ok(ok_json(body)))
    }

    pub fn failure(self, url: &str, failure: FetchFailure) -> Self {
        self.respond(url, Err(failure))
    }

    pub fn respond(self, url: &str, response: Result<HttpGetResult, FetchFailure>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }
}

pub fn ok_json(body: Value) -> HttpGetResult {
    HttpGetResult {
        status: 200,
        bytes: serde_json::to_vec(&body).unwrap(),
        content_type: "application/json".to_string(),
    }
}

#[async_trait]
impl HttpClientPort for ScriptedHttp {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpGetResult, FetchFailure> {
        self.calls.lock().unwrap().push((
            url.to_string(),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self.responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Err(FetchFailure::Network {
                    url: url.to_string(),
                    message: "no scripted response".to_string(),
                })
            })
    }
}
