//! Metrics provider reading a JSON document from disk on every poll.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_bootable::BoxError;
use keel_monitor::{MetricsProvider, MetricsSnapshot};
use serde_json::Value;

/// Reads a metrics snapshot from a JSON file.
///
/// A top-level `taken_at` RFC 3339 timestamp, if present, is used as the
/// snapshot time; otherwise the time of the read is.
#[derive(Clone, Debug)]
pub struct FileMetricsProvider {
    path: PathBuf,
}

impl FileMetricsProvider {
    /// Creates a provider for `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// File being read.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsProvider for FileMetricsProvider {
    async fn snapshot(&self) -> Result<MetricsSnapshot, BoxError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            format!("failed to read metrics file {}: {e}", self.path.display())
        })?;
        let values: Value = serde_json::from_str(&content)?;

        let taken_at = values
            .get("taken_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        Ok(MetricsSnapshot::at(taken_at, values))
    }
}
