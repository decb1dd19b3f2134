//! Runtime configuration.
//!
//! Read from an optional JSON file, then overridden field by field from
//! `COD_*` environment variables. Every field has a default so an empty file
//! (or none at all) yields a working local setup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{CodError, CodResult};

pub const DEFAULT_LOG_FILTER: &str = "info,cod_custody=debug";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    #[serde(alias = "database_path")]
    pub database_path: PathBuf,
    #[serde(alias = "log_dir")]
    pub log_dir: PathBuf,
    #[serde(alias = "log_filter")]
    pub log_filter: String,
    /// Rolling log files kept on disk; older ones are pruned at startup.
    #[serde(alias = "max_log_files")]
    pub max_log_files: usize,
    #[serde(alias = "proof_upload_url")]
    pub proof_upload_url: Option<String>,
    #[serde(alias = "notify_webhook_url")]
    pub notify_webhook_url: Option<String>,
    #[serde(alias = "http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            database_path: PathBuf::from("data").join("cod-custody.db"),
            log_dir: PathBuf::from("logs"),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            max_log_files: 10,
            proof_upload_url: None,
            notify_webhook_url: None,
            http_timeout_secs: 30,
        }
    }
}

impl LedgerConfig {
    pub fn from_json_file(path: &Path) -> CodResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CodError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> CodResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| CodError::Validation(format!("invalid config: {e}")))
    }

    /// Apply `COD_*` overrides through `lookup` (normally `std::env::var`).
    ///
    /// An empty URL variable clears the configured URL.
    pub fn apply_env<F>(&mut self, lookup: F) -> CodResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COD_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("COD_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("COD_LOG_FILTER") {
            self.log_filter = v;
        }
        if let Some(v) = lookup("COD_MAX_LOG_FILES") {
            self.max_log_files = v.trim().parse().map_err(|_| {
                CodError::Validation(format!("COD_MAX_LOG_FILES must be a number, got '{v}'"))
            })?;
        }
        if let Some(v) = lookup("COD_PROOF_UPLOAD_URL") {
            self.proof_upload_url = non_blank(v);
        }
        if let Some(v) = lookup("COD_NOTIFY_WEBHOOK_URL") {
            self.notify_webhook_url = non_blank(v);
        }
        if let Some(v) = lookup("COD_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v.trim().parse().map_err(|_| {
                CodError::Validation(format!("COD_HTTP_TIMEOUT_SECS must be a number, got '{v}'"))
            })?;
        }
        Ok(())
    }

    /// File (when given) plus process environment.
    pub fn load(path: Option<&Path>) -> CodResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(database = %config.database_path.display(), "Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> CodResult<()> {
        if self.http_timeout_secs == 0 {
            return Err(CodError::Validation("http timeout must be at least 1 second".into()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(CodError::Validation("database path is required".into()));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
