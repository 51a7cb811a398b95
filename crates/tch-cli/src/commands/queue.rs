//! Inspect and repair the local retry queue.

use anyhow::{bail, Result};
use tch_config::DeskConfig;
use tch_schemas::OrderId;

pub async fn list(cfg: &DeskConfig) -> Result<()> {
    let queue = super::open_queue(cfg).await?;
    let tasks = queue.list_oldest_first().await?;
    println!("count={}", tasks.len());
    for t in tasks {
        println!(
            "order_id={} created_at_epoch_millis={} uploading={} path={}",
            t.order_id,
            t.created_at_epoch_millis,
            t.uploading,
            t.local_snapshot_path.display()
        );
    }
    Ok(())
}

pub async fn discard(cfg: &DeskConfig, order_id: OrderId, yes: bool) -> Result<()> {
    if !yes {
        bail!(
            "REFUSING DISCARD: order {order_id} will have to be re-rendered. Re-run with: `tch queue discard --order-id {order_id} --yes`"
        );
    }
    let queue = super::open_queue(cfg).await?;
    let existed = queue.delete(order_id).await?;
    println!("discarded={existed} order_id={order_id}");
    Ok(())
}
