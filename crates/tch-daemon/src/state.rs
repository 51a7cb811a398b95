//! Shared runtime state for tch-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The pool and upload
//! store are cheap to clone; the bus fans order events out to SSE clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tch_config::DaemonSection;
use tch_schemas::OrderId;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Order { order_id: OrderId, event: OrderEvent },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    IntentCreated,
    IntentSaved,
    IntentConfirmed,
    FormalTransferred,
    FormalClosed,
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// UploadStore
// ---------------------------------------------------------------------------

/// Where uploaded certificates are kept and how they are addressed publicly.
#[derive(Clone, Debug)]
pub struct UploadStore {
    dir: PathBuf,
    public_base_url: String,
}

/// A certificate written by [`UploadStore::save`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub url: String,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            dir: dir.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(daemon: &DaemonSection) -> Self {
        Self::new(daemon.upload_dir.clone(), &daemon.public_base_url)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&self, order_id: OrderId, bytes: &[u8]) -> Result<StoredUpload> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create upload dir {}", self.dir.display()))?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let name = tch_db::stored_snapshot_name(order_id, Utc::now().timestamp(), &upload_id);
        let path = self.dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write upload {}", path.display()))?;
        Ok(StoredUpload {
            path,
            url: format!("{}/{}", self.public_base_url, name),
        })
    }

    /// Remove an upload whose migration did not commit.
    pub async fn discard(&self, upload: &StoredUpload) {
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            warn!(path = %upload.path.display(), error = %e, "failed to discard upload");
        }
    }
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub pool: SqlitePool,
    pub uploads: UploadStore,
}

impl AppState {
    pub fn new(pool: SqlitePool, uploads: UploadStore) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "tch-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            pool,
            uploads,
        }
    }

    pub fn publish(&self, order_id: OrderId, event: OrderEvent) {
        let _ = self.bus.send(BusMsg::Order { order_id, event });
    }
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
