//! Formal store and the intent → formal migration transaction.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tch_schemas::{
    FinalizeAck, FinalizeFields, FormalOrder, Notification, OrderId, OrderStage, TargetFields,
    NOTIFICATION_FORMAL_TRANSFERRED,
};
use tracing::{info, warn};

use crate::intent::fetch_intent_row;
use crate::{decode_stage, is_unique_violation, writer_lock, StoreError, StoreResult};

const FORMAL_COLUMNS: &str = r#"
    id, original_order_id, status, target_gift_name, target_qty, delivery_date,
    contact_method, contact_name, manager_id, manager_name, final_image_path,
    local_image_path, created_at
"#;

/// Where the uploaded certificate ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLocation {
    /// Public URL of the server-side copy.
    pub url: Option<String>,
    /// Path of the file on the submitting desk.
    pub local_path: Option<String>,
}

/// Name under which the server stores an uploaded certificate:
/// `formal_{id}_{unix_seconds}_{upload_id}.png`.
///
/// `upload_id` is unique per request, so two uploads for the same order in
/// the same second never share a file.
pub fn stored_snapshot_name(order_id: OrderId, unix_seconds: i64, upload_id: &str) -> String {
    format!("formal_{order_id}_{unix_seconds}_{upload_id}.png")
}

/// Steps inside the migration transaction where a test can force an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    AfterFormalInsert,
    AfterNotification,
    BeforeCommit,
}

/// Move a confirmed intent order into the formal store.
///
/// In one transaction: insert the formal copy (back-referencing the intent
/// id), insert a `FORMAL_TRANSFERRED` notification, delete the intent row.
/// Either all three commit or none do.
///
/// A second call for an order that is already formal returns the existing
/// record with `already_migrated = true` and writes nothing.
pub async fn finalize_order(
    pool: &SqlitePool,
    fields: &FinalizeFields,
    snapshot: &SnapshotLocation,
) -> StoreResult<FinalizeAck> {
    finalize_inner(pool, fields, snapshot, None).await
}

/// [`finalize_order`] that aborts with a storage error at `fault`.
#[cfg(feature = "testkit")]
pub async fn finalize_order_with_fault(
    pool: &SqlitePool,
    fields: &FinalizeFields,
    snapshot: &SnapshotLocation,
    fault: FaultPoint,
) -> StoreResult<FinalizeAck> {
    finalize_inner(pool, fields, snapshot, Some(fault)).await
}

fn trip(fault: Option<FaultPoint>, at: FaultPoint) -> StoreResult<()> {
    if fault == Some(at) {
        return Err(StoreError::Storage(anyhow::anyhow!(
            "injected fault at {at:?}"
        )));
    }
    Ok(())
}

async fn finalize_inner(
    pool: &SqlitePool,
    fields: &FinalizeFields,
    snapshot: &SnapshotLocation,
    fault: Option<FaultPoint>,
) -> StoreResult<FinalizeAck> {
    let order_id = fields.order_id;
    if fields.handler.name.trim().is_empty() {
        return Err(StoreError::Invalid("handler name must not be empty".into()));
    }
    if !fields.confirm {
        return Err(StoreError::NotConfirmed(order_id));
    }

    let _guard = writer_lock().lock().await;
    let mut tx = pool.begin().await?;

    if let Some(existing) = fetch_formal_row(&mut *tx, order_id).await? {
        info!(order_id, formal_id = existing.id, "finalize: already migrated");
        return Ok(already_migrated(existing));
    }

    let (intent, confirmed) = fetch_intent_row(&mut *tx, order_id)
        .await?
        .ok_or(StoreError::NotFound(order_id))?;
    if !confirmed || intent.stage != OrderStage::Confirmed {
        return Err(StoreError::NotConfirmed(order_id));
    }

    // The locked intent row is authoritative for the copied target fields.
    if fields.target != intent.target {
        warn!(
            order_id,
            "finalize: request target fields differ from the locked intent row; using the row"
        );
    }
    let contact_method = intent
        .contact_method
        .clone()
        .or_else(|| fields.contact_method.clone());

    let inserted = sqlx::query(
        r#"
        insert into formal_orders (
          original_order_id, status, target_gift_name, target_qty, delivery_date,
          contact_method, contact_name, manager_id, manager_name,
          final_image_path, local_image_path, created_at
        ) values (?1, 'FORMAL', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(order_id)
    .bind(&intent.target.gift_name)
    .bind(intent.target.qty)
    .bind(&intent.target.delivery_date)
    .bind(&contact_method)
    .bind(&intent.contact_name)
    .bind(fields.handler.id)
    .bind(&fields.handler.name)
    .bind(&snapshot.url)
    .bind(&snapshot.local_path)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await;

    let formal_id = match inserted {
        Ok(res) => res.last_insert_rowid(),
        Err(e) if is_unique_violation(&e) => {
            drop(tx);
            let existing = fetch_formal_row(pool, order_id)
                .await?
                .ok_or_else(|| StoreError::Database(e))?;
            info!(order_id, formal_id = existing.id, "finalize: lost race, already migrated");
            return Ok(already_migrated(existing));
        }
        Err(e) => return Err(e.into()),
    };
    trip(fault, FaultPoint::AfterFormalInsert)?;

    sqlx::query(
        r#"
        insert into order_notifications (order_id, message, type, created_at)
        values (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(order_id)
    .bind(format!(
        "Order #{order_id} was transferred to a formal order by {}",
        fields.handler.name
    ))
    .bind(NOTIFICATION_FORMAL_TRANSFERRED)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    trip(fault, FaultPoint::AfterNotification)?;

    let deleted = sqlx::query("delete from intent_orders where id = ?1")
        .bind(order_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted != 1 {
        return Err(StoreError::Storage(anyhow::anyhow!(
            "expected to delete one intent row for order {order_id}, deleted {deleted}"
        )));
    }
    trip(fault, FaultPoint::BeforeCommit)?;

    tx.commit().await?;

    info!(
        order_id,
        formal_id,
        handler_id = fields.handler.id,
        "order migrated to formal store"
    );

    Ok(FinalizeAck {
        order_id,
        formal_id,
        already_migrated: false,
        snapshot_url: snapshot.url.clone(),
    })
}

fn already_migrated(existing: FormalOrder) -> FinalizeAck {
    FinalizeAck {
        order_id: existing.original_order_id,
        formal_id: existing.id,
        already_migrated: true,
        snapshot_url: existing.snapshot_url,
    }
}

// ---------------------------------------------------------------------------
// Formal queries
// ---------------------------------------------------------------------------

async fn fetch_formal_row<'e, E>(exec: E, original_order_id: OrderId) -> Result<Option<FormalOrder>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("select {FORMAL_COLUMNS} from formal_orders where original_order_id = ?1");
    let row = sqlx::query(&sql)
        .bind(original_order_id)
        .fetch_optional(exec)
        .await
        .context("fetch_formal_row failed")?;
    row.as_ref().map(formal_from_row).transpose()
}

pub async fn fetch_formal_by_original(
    pool: &SqlitePool,
    original_order_id: OrderId,
) -> Result<Option<FormalOrder>> {
    fetch_formal_row(pool, original_order_id).await
}

pub async fn count_formal_for_original(pool: &SqlitePool, original_order_id: OrderId) -> Result<i64> {
    let n: i64 =
        sqlx::query_scalar("select count(*) from formal_orders where original_order_id = ?1")
            .bind(original_order_id)
            .fetch_one(pool)
            .await
            .context("count_formal_for_original failed")?;
    Ok(n)
}

/// All formal orders, newest first.
pub async fn list_formal_orders(pool: &SqlitePool) -> Result<Vec<FormalOrder>> {
    let sql = format!("select {FORMAL_COLUMNS} from formal_orders order by created_at desc, id desc");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("list_formal_orders failed")?;
    rows.iter().map(formal_from_row).collect()
}

pub async fn list_notifications_for_order(
    pool: &SqlitePool,
    order_id: OrderId,
) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        r#"
        select id, order_id, message, type, created_at
        from order_notifications
        where order_id = ?1
        order by id asc
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("list_notifications_for_order failed")?;

    rows.iter()
        .map(|r| -> Result<Notification> {
            Ok(Notification {
                id: r.try_get("id")?,
                order_id: r.try_get("order_id")?,
                message: r.try_get("message")?,
                kind: r.try_get("type")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .collect()
}

/// Terminal handler action on a formal order: FORMAL → COMPLETED | TERMINATED.
///
/// Only the handler recorded on the formal row may close it, and only once.
pub async fn close_formal_order(
    pool: &SqlitePool,
    original_order_id: OrderId,
    status: OrderStage,
    handler_id: i64,
) -> StoreResult<FormalOrder> {
    if !status.is_terminal() {
        return Err(StoreError::Invalid(format!(
            "terminal status must be COMPLETED or TERMINATED, got {status}"
        )));
    }

    let _guard = writer_lock().lock().await;
    let mut tx = pool.begin().await?;

    let current = fetch_formal_row(&mut *tx, original_order_id)
        .await?
        .ok_or(StoreError::NotFound(original_order_id))?;
    if current.status != OrderStage::Formal {
        return Err(StoreError::AlreadyClosed {
            order_id: original_order_id,
            status: current.status,
        });
    }
    if current.handler_id != handler_id {
        return Err(StoreError::Invalid(format!(
            "order {original_order_id} is handled by {}",
            current.handler_id
        )));
    }

    sqlx::query(
        r#"
        update formal_orders
           set status = ?2, closed_at = ?3
         where original_order_id = ?1 and status = 'FORMAL'
        "#,
    )
    .bind(original_order_id)
    .bind(status.as_str())
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(order_id = original_order_id, handler_id, status = %status, "formal order closed");

    Ok(FormalOrder { status, ..current })
}

fn formal_from_row(row: &SqliteRow) -> Result<FormalOrder> {
    Ok(FormalOrder {
        id: row.try_get("id")?,
        original_order_id: row.try_get("original_order_id")?,
        status: decode_stage(&row.try_get::<String, _>("status")?)?,
        target: TargetFields {
            gift_name: row.try_get("target_gift_name")?,
            qty: row.try_get("target_qty")?,
            delivery_date: row.try_get("delivery_date")?,
        },
        contact_name: row.try_get("contact_name")?,
        contact_method: row.try_get("contact_method")?,
        handler_id: row.try_get("manager_id")?,
        handler_name: row.try_get("manager_name")?,
        snapshot_url: row.try_get("final_image_path")?,
        local_snapshot_path: row.try_get("local_image_path")?,
        created_at: row.try_get("created_at")?,
    })
}
