//! Typed desk configuration.
//!
//! Every section is defaulted so a bare `{}` document is a valid config. The
//! environment is consulted exactly once, in [`DeskConfig::apply_env_overrides`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const ENV_DATABASE_URL: &str = "TCH_DATABASE_URL";
pub const ENV_DAEMON_ADDR: &str = "TCH_DAEMON_ADDR";
pub const ENV_REMOTE_BASE_URL: &str = "TCH_REMOTE_BASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub remote: RemoteSection,
    pub render: RenderSection,
    pub queue: QueueSection,
    pub snapshots: SnapshotSection,
    pub daemon: DaemonSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8899".to_string(),
            connect_timeout_ms: 15_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl RemoteSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSection {
    /// Fixed certificate width in pixels.
    pub width: u32,
    /// Height used when the measured content height is not positive.
    pub default_height: u32,
    /// Upper bound on waiting for the content's completion signal.
    pub signal_timeout_ms: u64,
    /// Quiet period between the completion signal and pixel capture.
    pub settle_ms: u64,
}

impl Default for RenderSection {
    fn default() -> Self {
        Self {
            width: 1080,
            default_height: 2500,
            signal_timeout_ms: 10_000,
            settle_ms: 200,
        }
    }
}

impl RenderSection {
    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub db_path: PathBuf,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tch_retry_queue.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub dir: PathBuf,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("snapshots/formal_orders"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub bind_addr: String,
    pub db_url: String,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8899".to_string(),
            db_url: "sqlite://tch_orders.db".to_string(),
            upload_dir: PathBuf::from("uploads"),
            public_base_url: "http://127.0.0.1:8899/files".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl DeskConfig {
    /// Apply `TCH_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.daemon.db_url = url;
        }
        if let Some(addr) = lookup(ENV_DAEMON_ADDR) {
            self.daemon.bind_addr = addr;
        }
        if let Some(base) = lookup(ENV_REMOTE_BASE_URL) {
            self.remote.base_url = base;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.render.width == 0 {
            bail!("render.width must be > 0");
        }
        if self.render.default_height == 0 {
            bail!("render.default_height must be > 0");
        }
        if self.render.signal_timeout_ms == 0 {
            bail!("render.signal_timeout_ms must be > 0");
        }
        if self.render.settle_ms >= self.render.signal_timeout_ms {
            bail!("render.settle_ms must be shorter than render.signal_timeout_ms");
        }
        if self.remote.connect_timeout_ms == 0 || self.remote.request_timeout_ms == 0 {
            bail!("remote timeouts must be > 0");
        }
        if self.remote.base_url.trim().is_empty() {
            bail!("remote.base_url must not be empty");
        }
        Ok(())
    }
}
