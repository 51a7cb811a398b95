//! Intent store: editable order drafts.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tch_schemas::{
    LineItem, LockIntentAck, LockIntentRequest, NewIntentOrder, Order, OrderId, OrderStage,
    TargetFields, UNASSIGNED_HANDLER_ID,
};
use tracing::info;

use crate::{decode_stage, is_unique_violation, writer_lock, StoreError, StoreResult};

const INTENT_COLUMNS: &str = r#"
    id, stage, contact_name, contact_method, details, target_gift_name, target_qty,
    delivery_date, intent_confirm_status, manager_id, manager_name, ai_suggestion,
    final_image_path, created_at
"#;

fn validate_new(order: &NewIntentOrder) -> StoreResult<()> {
    if order.contact_name.trim().is_empty() {
        return Err(StoreError::Invalid("contact_name must not be empty".into()));
    }
    if order.line_items.is_empty() {
        return Err(StoreError::Invalid("at least one line item is required".into()));
    }
    if let Some(bad) = order.line_items.iter().find(|li| li.qty <= 0 || li.name.trim().is_empty()) {
        return Err(StoreError::Invalid(format!(
            "line item '{}' must have a name and qty > 0",
            bad.name
        )));
    }
    Ok(())
}

/// Insert a new intent order; the database assigns the id.
pub async fn insert_intent(pool: &SqlitePool, order: &NewIntentOrder) -> StoreResult<Order> {
    validate_new(order)?;
    let details = serde_json::to_string(&order.line_items).context("encode line items")?;

    let _guard = writer_lock().lock().await;
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        insert into intent_orders (contact_name, contact_method, details, manager_id, ai_suggestion, created_at)
        values (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&order.contact_name)
    .bind(&order.contact_method)
    .bind(&details)
    .bind(order.handler_id)
    .bind(&order.suggestion)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .context("insert_intent failed")?
    .last_insert_rowid();

    let created = fetch_intent_row(&mut *tx, id)
        .await?
        .map(|(order, _)| order)
        .ok_or(StoreError::NotFound(id))?;
    tx.commit().await?;

    info!(order_id = id, handler_id = order.handler_id, "intent order created");
    Ok(created)
}

/// Insert an intent order under a caller-chosen id (imports and fixtures).
///
/// Refuses ids already present in either store.
pub async fn insert_intent_with_id(
    pool: &SqlitePool,
    id: OrderId,
    order: &NewIntentOrder,
) -> StoreResult<Order> {
    validate_new(order)?;
    if id <= 0 {
        return Err(StoreError::Invalid(format!("order id must be positive, got {id}")));
    }
    let details = serde_json::to_string(&order.line_items).context("encode line items")?;

    {
        let _guard = writer_lock().lock().await;
        let mut tx = pool.begin().await?;

        let formal: i64 =
            sqlx::query_scalar("select count(*) from formal_orders where original_order_id = ?1")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if formal > 0 {
            return Err(StoreError::Invalid(format!(
                "order id {id} already exists in the formal store"
            )));
        }

        let res = sqlx::query(
            r#"
            insert into intent_orders (id, contact_name, contact_method, details, manager_id, ai_suggestion, created_at)
            values (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(id)
        .bind(&order.contact_name)
        .bind(&order.contact_method)
        .bind(&details)
        .bind(order.handler_id)
        .bind(&order.suggestion)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match res {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Invalid(format!("order id {id} already exists")));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
    }

    info!(order_id = id, handler_id = order.handler_id, "intent order created");
    fetch_intent(pool, id).await?.ok_or(StoreError::NotFound(id))
}

pub(crate) async fn fetch_intent_row<'e, E>(exec: E, id: OrderId) -> Result<Option<(Order, bool)>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("select {INTENT_COLUMNS} from intent_orders where id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("fetch_intent failed")?;

    row.map(|r| -> Result<(Order, bool)> {
        let confirmed: i64 = r.try_get("intent_confirm_status")?;
        Ok((intent_from_row(&r)?, confirmed != 0))
    })
    .transpose()
}

pub async fn fetch_intent(pool: &SqlitePool, id: OrderId) -> Result<Option<Order>> {
    Ok(fetch_intent_row(pool, id).await?.map(|(order, _)| order))
}

/// Intent orders visible to a handler: their own plus unassigned ones, newest first.
pub async fn list_intents_for_handler(pool: &SqlitePool, handler_id: i64) -> Result<Vec<Order>> {
    let sql = format!(
        r#"
        select {INTENT_COLUMNS}
        from intent_orders
        where manager_id = ?1 or manager_id = ?2
        order by created_at desc, id desc
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(handler_id)
        .bind(UNASSIGNED_HANDLER_ID)
        .fetch_all(pool)
        .await
        .context("list_intents_for_handler failed")?;

    rows.iter().map(intent_from_row).collect()
}

/// Save the handler-edited target fields.
///
/// `confirm = true` locks the order (stage CONFIRMED, confirm flag set) and
/// clears the advisory suggestion. `confirm = false` saves a draft and leaves
/// the stage alone. An unassigned order is claimed by the calling handler.
/// Calling twice with the same request leaves the row unchanged.
pub async fn lock_intent_fields(
    pool: &SqlitePool,
    req: &LockIntentRequest,
) -> StoreResult<LockIntentAck> {
    if req.target.qty < 0 {
        return Err(StoreError::Invalid("target_qty must be >= 0".into()));
    }

    let _guard = writer_lock().lock().await;
    let mut tx = pool.begin().await?;

    let formal: i64 =
        sqlx::query_scalar("select count(*) from formal_orders where original_order_id = ?1")
            .bind(req.order_id)
            .fetch_one(&mut *tx)
            .await?;
    if formal > 0 {
        return Err(StoreError::Frozen(req.order_id));
    }

    let (current, _) = fetch_intent_row(&mut *tx, req.order_id)
        .await?
        .ok_or(StoreError::NotFound(req.order_id))?;

    if current.handler_id != UNASSIGNED_HANDLER_ID && current.handler_id != req.handler_id {
        return Err(StoreError::Invalid(format!(
            "order {} belongs to handler {}",
            req.order_id, current.handler_id
        )));
    }

    let stage = if req.confirm {
        OrderStage::Confirmed
    } else {
        current.stage
    };

    sqlx::query(
        r#"
        update intent_orders
           set target_gift_name = ?2,
               target_qty = ?3,
               delivery_date = ?4,
               contact_method = coalesce(?5, contact_method),
               intent_confirm_status = case when ?6 then 1 else intent_confirm_status end,
               ai_suggestion = case when ?6 then null else ai_suggestion end,
               stage = ?7,
               manager_id = ?8
         where id = ?1
        "#,
    )
    .bind(req.order_id)
    .bind(&req.target.gift_name)
    .bind(req.target.qty)
    .bind(&req.target.delivery_date)
    .bind(&req.contact_method)
    .bind(req.confirm)
    .bind(stage.as_str())
    .bind(req.handler_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        order_id = req.order_id,
        handler_id = req.handler_id,
        confirm = req.confirm,
        stage = %stage,
        "intent fields saved"
    );

    Ok(LockIntentAck {
        order_id: req.order_id,
        stage,
    })
}

fn intent_from_row(row: &SqliteRow) -> Result<Order> {
    let details: String = row.try_get("details")?;
    let line_items: Vec<LineItem> =
        serde_json::from_str(&details).context("stored line items are not valid JSON")?;

    Ok(Order {
        id: row.try_get("id")?,
        stage: decode_stage(&row.try_get::<String, _>("stage")?)?,
        contact_name: row.try_get("contact_name")?,
        contact_method: row.try_get("contact_method")?,
        line_items,
        target: TargetFields {
            gift_name: row.try_get("target_gift_name")?,
            qty: row.try_get("target_qty")?,
            delivery_date: row.try_get("delivery_date")?,
        },
        handler_id: row.try_get("manager_id")?,
        handler_name: row.try_get("manager_name")?,
        suggestion: row.try_get("ai_suggestion")?,
        created_at: row.try_get("created_at")?,
        snapshot_ref: row.try_get("final_image_path")?,
        original_order_id: None,
    })
}
