/**
 * PERSISTENCE SINK - Best-effort storage of accepted telemetry fields
 *
 * ROLE :
 * Boundary to the storage engine. The hot path hands writes to `spawn_save`
 * and moves on; failures are logged and never retried (the next telemetry
 * message carries fresh data anyway).
 *
 * DEFAULT IMPLEMENTATION :
 * PulseLogFile appends one JSON line per write: {deviceId, field, value, recordedAt}.
 * recordedAt is the time the reading reached the relay, not the write time.
 */

use crate::error::PersistError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(
        &self,
        device_id: &str,
        field: &str,
        value: &Value,
        recorded_at: OffsetDateTime,
    ) -> Result<(), PersistError>;
}

pub type SharedSink = Arc<dyn PersistenceSink>;

/// Fire-and-forget write. The handle is only useful to tests.
pub fn spawn_save(
    sink: SharedSink,
    device_id: String,
    field: &'static str,
    value: Value,
    recorded_at: OffsetDateTime,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.save(&device_id, field, &value, recorded_at).await {
            warn!("[persist] {field} for {device_id} not saved: {e}");
        }
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogLine<'a> {
    device_id: &'a str,
    field: &'a str,
    value: &'a Value,
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: OffsetDateTime,
}

/// Append-only JSON-lines log.
pub struct PulseLogFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PulseLogFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Creates the parent directory if needed.
    pub async fn prepare(&self) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceSink for PulseLogFile {
    async fn save(
        &self,
        device_id: &str,
        field: &str,
        value: &Value,
        recorded_at: OffsetDateTime,
    ) -> Result<(), PersistError> {
        let line = LogLine {
            device_id,
            field,
            value,
            recorded_at,
        };
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        // one writer at a time keeps lines whole
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}
