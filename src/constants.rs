/// Constants shared by the importer, the CLI and the read-side API

// Environment variables
pub const ENV_SYMPLA_API_TOKEN: &str = "SYMPLA_API_TOKEN";
pub const ENV_SYMPLA_BASE_URL: &str = "SYMPLA_BASE_URL";
pub const ENV_SYMPLA_TIMEOUT_SECONDS: &str = "SYMPLA_TIMEOUT_SECONDS";
pub const ENV_DATABASE_PATH: &str = "IMPORTER_DATABASE_PATH";
pub const ENV_SERVER_PORT: &str = "IMPORTER_PORT";

// Sympla API
pub const SYMPLA_TOKEN_HEADER: &str = "S_Token";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 15;

// Local defaults
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_DATABASE_PATH: &str = "data/events.db";
pub const DEFAULT_SERVER_PORT: u16 = 8000;
pub const LOG_DIR: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "importer.log";

// Listing endpoint paging
pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;
pub const DEFAULT_BATCH_LIST_LIMIT: usize = 20;
