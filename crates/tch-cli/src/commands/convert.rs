//! Run the conversion pipeline from the command line.

use anyhow::{bail, Result};
use tch_config::DeskConfig;
use tch_conversion::{ConversionCoordinator, ConversionOutcome, ConversionState};
use tch_schemas::{Handler, OrderId};
use tracing::info;

pub async fn convert(cfg: &DeskConfig, order_id: OrderId, handler: &Handler) -> Result<()> {
    let coordinator = super::coordinator(cfg).await?;
    let visible = coordinator.refresh_intents(handler).await?;
    info!(order_id, visible, handler_id = handler.id, "convert requested");
    let progress = spawn_progress(&coordinator);

    let result = coordinator.start(order_id, handler).await;
    progress.abort();

    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(e) => {
            println!(
                "converted=false order_id={} retryable={} reason={}",
                order_id,
                e.is_retryable(),
                e
            );
            bail!("conversion of order {order_id} failed: {e}")
        }
    }
}

pub async fn resume(cfg: &DeskConfig, handler: &Handler) -> Result<()> {
    let coordinator = super::coordinator(cfg).await?;
    coordinator.refresh_intents(handler).await?;
    let progress = spawn_progress(&coordinator);

    let report = coordinator.resume_pending(handler).await?;
    progress.abort();

    println!(
        "attempted={} completed={} failed={} skipped={}",
        report.attempted.len(),
        report.completed.len(),
        report.failed.len(),
        report.skipped_in_flight.len()
    );
    for outcome in &report.completed {
        print_outcome(outcome);
    }
    for (order_id, e) in &report.failed {
        println!(
            "converted=false order_id={} retryable={} reason={}",
            order_id,
            e.is_retryable(),
            e
        );
    }
    if !report.failed.is_empty() {
        bail!("{} queued conversion(s) failed", report.failed.len());
    }
    Ok(())
}

/// Print pipeline progress to stderr while a conversion runs.
fn spawn_progress(coordinator: &ConversionCoordinator) -> tokio::task::JoinHandle<()> {
    let mut rx = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = rx.recv().await {
            let label = match &ev.state {
                ConversionState::Idle => "queued",
                ConversionState::Rendering => "rendering certificate",
                ConversionState::Uploading => "uploading snapshot",
                ConversionState::ServerFinalizing => "waiting for server",
                ConversionState::Done => "done",
                ConversionState::Failed { .. } => "failed",
            };
            eprintln!("[order {}] {}", ev.order_id, label);
        }
    })
}

fn print_outcome(outcome: &ConversionOutcome) {
    println!(
        "converted=true order_id={} formal_id={} already_migrated={} rendered={}",
        outcome.order_id, outcome.formal_id, outcome.already_migrated, outcome.rendered
    );
    println!("snapshot_path={}", outcome.snapshot_path.display());
    if let Some(url) = &outcome.snapshot_url {
        println!("snapshot_url={url}");
    }
}
