//! Durable local retry queue.
//!
//! One row per order whose certificate has been rendered and written to disk
//! but whose migration the server has not yet confirmed. Rows survive process
//! death; the resume sweep lists them oldest-first and picks each up at the
//! upload step.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tch_schemas::OrderId;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySnapshotTask {
    pub order_id: OrderId,
    pub local_snapshot_path: PathBuf,
    pub created_at_epoch_millis: i64,
    pub uploading: bool,
}

impl RetrySnapshotTask {
    /// A task created now, not yet uploading.
    pub fn new(order_id: OrderId, local_snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            order_id,
            local_snapshot_path: local_snapshot_path.into(),
            created_at_epoch_millis: Utc::now().timestamp_millis(),
            uploading: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryQueue {
    pool: SqlitePool,
}

impl RetryQueue {
    /// Open (or create) the queue database at `path` and apply its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open retry queue {}", path.display()))?;

        let queue = Self { pool };
        queue.migrate().await?;
        Ok(queue)
    }

    /// Wrap an existing pool. The caller is responsible for [`RetryQueue::migrate`].
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("retry queue migrate failed")?;
        Ok(())
    }

    /// Insert or replace the entry for `task.order_id`.
    ///
    /// A replaced entry takes the new path and timestamp and is no longer
    /// marked uploading.
    pub async fn upsert(&self, task: &RetrySnapshotTask) -> Result<()> {
        sqlx::query(
            r#"
            insert into pending_snapshot_tasks (order_id, local_snapshot_path, created_at_epoch_millis, uploading)
            values (?1, ?2, ?3, ?4)
            on conflict (order_id) do update set
              local_snapshot_path = excluded.local_snapshot_path,
              created_at_epoch_millis = excluded.created_at_epoch_millis,
              uploading = excluded.uploading
            "#,
        )
        .bind(task.order_id)
        .bind(task.local_snapshot_path.to_string_lossy().into_owned())
        .bind(task.created_at_epoch_millis)
        .bind(task.uploading)
        .execute(&self.pool)
        .await
        .with_context(|| format!("retry upsert failed for order {}", task.order_id))?;

        info!(
            order_id = task.order_id,
            path = %task.local_snapshot_path.display(),
            "retry task recorded"
        );
        Ok(())
    }

    pub async fn get(&self, order_id: OrderId) -> Result<Option<RetrySnapshotTask>> {
        let row = sqlx::query(
            r#"
            select order_id, local_snapshot_path, created_at_epoch_millis, uploading
            from pending_snapshot_tasks
            where order_id = ?1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("retry get failed")?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Every entry, oldest first. Ties break on order id.
    pub async fn list_oldest_first(&self) -> Result<Vec<RetrySnapshotTask>> {
        let rows = sqlx::query(
            r#"
            select order_id, local_snapshot_path, created_at_epoch_millis, uploading
            from pending_snapshot_tasks
            order by created_at_epoch_millis asc, order_id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("retry list failed")?;

        rows.iter().map(task_from_row).collect()
    }

    /// Remove the entry. Returns whether one existed.
    pub async fn delete(&self, order_id: OrderId) -> Result<bool> {
        let n = sqlx::query("delete from pending_snapshot_tasks where order_id = ?1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("retry delete failed for order {order_id}"))?
            .rows_affected();
        if n > 0 {
            info!(order_id, "retry task cleared");
        }
        Ok(n > 0)
    }

    /// Compare-and-swap the `uploading` flag from false to true.
    ///
    /// Returns `false` when the entry is missing or already uploading.
    pub async fn try_mark_uploading(&self, order_id: OrderId) -> Result<bool> {
        let n = sqlx::query(
            "update pending_snapshot_tasks set uploading = 1 where order_id = ?1 and uploading = 0",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("retry mark uploading failed for order {order_id}"))?
        .rows_affected();
        debug!(order_id, claimed = n == 1, "retry task upload claim");
        Ok(n == 1)
    }

    pub async fn clear_uploading(&self, order_id: OrderId) -> Result<()> {
        sqlx::query("update pending_snapshot_tasks set uploading = 0 where order_id = ?1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("retry clear uploading failed for order {order_id}"))?;
        Ok(())
    }

    /// Reset every `uploading` flag. Run once at sweep start: a flag still set
    /// then belongs to a process that died mid-upload.
    pub async fn reset_stale_uploading(&self) -> Result<u64> {
        let n = sqlx::query("update pending_snapshot_tasks set uploading = 0 where uploading = 1")
            .execute(&self.pool)
            .await
            .context("retry reset uploading failed")?
            .rows_affected();
        if n > 0 {
            info!(count = n, "reset stale uploading flags");
        }
        Ok(n)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(*) from pending_snapshot_tasks")
            .fetch_one(&self.pool)
            .await
            .context("retry count failed")?;
        Ok(n)
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create queue directory {}", dir.display()))
}

fn task_from_row(row: &SqliteRow) -> Result<RetrySnapshotTask> {
    let path: String = row.try_get("local_snapshot_path")?;
    Ok(RetrySnapshotTask {
        order_id: row.try_get("order_id")?,
        local_snapshot_path: PathBuf::from(path),
        created_at_epoch_millis: row.try_get("created_at_epoch_millis")?,
        uploading: row.try_get("uploading")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue(dir: &tempfile::TempDir) -> RetryQueue {
        RetryQueue::open(&dir.path().join("queue.db")).await.unwrap()
    }

    #[tokio::test]
    async fn upload_claim_is_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir).await;
        q.upsert(&RetrySnapshotTask::new(7, "/tmp/order_7.png")).await.unwrap();

        assert!(q.try_mark_uploading(7).await.unwrap());
        assert!(!q.try_mark_uploading(7).await.unwrap(), "second claim loses");
        assert!(!q.try_mark_uploading(8).await.unwrap(), "missing entry cannot be claimed");

        q.clear_uploading(7).await.unwrap();
        assert!(q.try_mark_uploading(7).await.unwrap());
        assert_eq!(q.reset_stale_uploading().await.unwrap(), 1);
        assert!(!q.get(7).await.unwrap().unwrap().uploading);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(&dir).await;
        let mut first = RetrySnapshotTask::new(7, "/tmp/a.png");
        first.created_at_epoch_millis = 1_000;
        q.upsert(&first).await.unwrap();
        q.try_mark_uploading(7).await.unwrap();

        let mut second = RetrySnapshotTask::new(7, "/tmp/b.png");
        second.created_at_epoch_millis = 2_000;
        q.upsert(&second).await.unwrap();

        assert_eq!(q.count().await.unwrap(), 1);
        let got = q.get(7).await.unwrap().unwrap();
        assert_eq!(got, second);
        assert!(q.delete(7).await.unwrap());
        assert!(!q.delete(7).await.unwrap());
    }
}
