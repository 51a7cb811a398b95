//! Server-side order stores: intent orders, formal orders and notifications.
//!
//! The formal store is written only by [`finalize_order`], which runs the
//! intent → formal migration as one transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tch_schemas::{OrderId, OrderStage};

mod intent;
mod migration;

pub use intent::{
    fetch_intent, insert_intent, insert_intent_with_id, list_intents_for_handler,
    lock_intent_fields,
};
#[cfg(feature = "testkit")]
pub use migration::finalize_order_with_fault;
pub use migration::{
    close_formal_order, count_formal_for_original, fetch_formal_by_original, finalize_order,
    list_formal_orders, list_notifications_for_order, stored_snapshot_name, FaultPoint,
    SnapshotLocation,
};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Failures surfaced by store operations.
///
/// The validation variants (`NotFound`, `NotConfirmed`, `Frozen`,
/// `AlreadyClosed`, `Invalid`) leave every row untouched and are not worth
/// retrying. `Database` / `Storage` mean the transaction rolled back and the
/// caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error("order {0} is not confirmed; lock the intent fields first")]
    NotConfirmed(OrderId),
    #[error("order {0} is already formal; target fields are frozen")]
    Frozen(OrderId),
    #[error("order {order_id} is already {status}")]
    AlreadyClosed { order_id: OrderId, status: OrderStage },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_validation(&self) -> bool {
        !matches!(self, StoreError::Database(_) | StoreError::Storage(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Connect to the SQLite database named by `url` (`sqlite://path.db`), creating it if needed.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid sqlite url: {url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to {url}"))
}

/// Connect to a database file at `path`.
pub async fn connect_file(path: &Path) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Location (I1 probe)
// ---------------------------------------------------------------------------

/// Which store currently holds an order id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLocation {
    Intent,
    Formal,
    Missing,
    /// Both stores hold the id. Never produced by a committed migration.
    Both,
}

/// Read both stores in one snapshot and report where `order_id` lives.
pub async fn locate_order(pool: &SqlitePool, order_id: OrderId) -> Result<OrderLocation> {
    let (in_intent, in_formal): (i64, i64) = sqlx::query_as(
        r#"
        select
          (select count(*) from intent_orders where id = ?1),
          (select count(*) from formal_orders where original_order_id = ?1)
        "#,
    )
    .bind(order_id)
    .fetch_one(pool)
    .await
    .context("locate_order failed")?;

    Ok(match (in_intent > 0, in_formal > 0) {
        (true, false) => OrderLocation::Intent,
        (false, true) => OrderLocation::Formal,
        (false, false) => OrderLocation::Missing,
        (true, true) => OrderLocation::Both,
    })
}

/// Process-wide writer lock for store mutations.
///
/// SQLite allows one writer at a time; a deferred transaction that reads and
/// then writes can fail with SQLITE_BUSY instead of waiting. Mutations that
/// read before writing take this lock for the lifetime of their transaction.
pub(crate) fn writer_lock() -> &'static tokio::sync::Mutex<()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

pub(crate) fn decode_stage(raw: &str) -> Result<OrderStage> {
    OrderStage::parse(raw).with_context(|| format!("invalid stored stage: {raw}"))
}

/// Detect a SQLite unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        // SQLITE_CONSTRAINT_UNIQUE = 2067, SQLITE_CONSTRAINT_PRIMARYKEY = 1555
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("2067") | Some("1555"))
        }
        _ => false,
    }
}
