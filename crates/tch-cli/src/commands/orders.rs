//! Read and lock orders on the Remote Order Service.

use anyhow::Result;
use tch_client::RemoteOrderService;
use tch_config::DeskConfig;
use tch_schemas::LockIntentRequest;

pub async fn intents(cfg: &DeskConfig, handler_id: i64) -> Result<()> {
    let orders = super::remote(cfg)?.fetch_intent_list(handler_id).await?;
    println!("count={}", orders.len());
    for o in orders {
        println!(
            "order_id={} stage={} contact={} items={} gift={} qty={}",
            o.id,
            o.stage.as_str(),
            o.contact_name,
            o.line_items.len(),
            o.target.gift_name.as_deref().unwrap_or(""),
            o.target.qty
        );
    }
    Ok(())
}

pub async fn formal(cfg: &DeskConfig) -> Result<()> {
    let orders = super::remote(cfg)?.fetch_formal_list().await?;
    println!("count={}", orders.len());
    for o in orders {
        println!(
            "original_order_id={} status={} gift={} qty={} handler={} snapshot={}",
            o.original_order_id,
            o.status,
            o.target.gift_name.as_deref().unwrap_or(""),
            o.target.qty,
            o.handler_name,
            o.snapshot_url.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn lock(cfg: &DeskConfig, req: &LockIntentRequest) -> Result<()> {
    let ack = super::remote(cfg)?.lock_intent_fields(req).await?;
    println!("order_id={} stage={}", ack.order_id, ack.stage);
    Ok(())
}
