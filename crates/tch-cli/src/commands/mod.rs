//! Command handlers for the `tch` CLI.
//!
//! Shared wiring used by several commands lives here; command-specific
//! logic lives in the submodules.

pub mod convert;
pub mod orders;
pub mod queue;

use std::sync::Arc;

use anyhow::{Context, Result};
use tch_client::HttpOrderService;
use tch_config::DeskConfig;
use tch_conversion::{ConversionCoordinator, OrderStore};
use tch_render::{RenderOptions, Renderer};
use tch_retry::RetryQueue;

pub fn remote(cfg: &DeskConfig) -> Result<HttpOrderService> {
    HttpOrderService::new(&cfg.remote).context("failed to build HTTP client")
}

pub async fn open_queue(cfg: &DeskConfig) -> Result<RetryQueue> {
    RetryQueue::open(&cfg.queue.db_path).await
}

/// Wire the full desk: HTTP remote, render engine thread, retry queue.
pub async fn coordinator(cfg: &DeskConfig) -> Result<ConversionCoordinator> {
    let remote = remote(cfg)?;
    let renderer = Renderer::start(RenderOptions::from(&cfg.render))
        .context("failed to start render engine")?;
    let queue = open_queue(cfg).await?;
    let coordinator = ConversionCoordinator::new(
        Arc::new(OrderStore::new()),
        Arc::new(renderer),
        queue,
        Arc::new(remote),
        cfg.snapshots.dir.clone(),
    )
    .await?;
    Ok(coordinator)
}
