pub mod apis;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod server;
pub mod storage;
pub mod types;

// Ports the pipeline depends on, and the adapters that implement them
pub mod app;
pub mod infra;

pub use error::{ImporterError, Result};
pub use pipeline::{ImportPipeline, ImportSummary};
