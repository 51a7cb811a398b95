//! The retry queue survives reopen and lists entries oldest-first.
//!
//! GREEN when:
//! - entries inserted out of order list by created_at ascending
//! - a reopened queue still holds every entry (process death)
//! - deleting one entry leaves the rest in order

use tch_retry::{RetryQueue, RetrySnapshotTask};

fn task(order_id: i64, created_at: i64) -> RetrySnapshotTask {
    RetrySnapshotTask {
        order_id,
        local_snapshot_path: format!("/desk/snapshots/order_{order_id}_formal_{created_at}.png").into(),
        created_at_epoch_millis: created_at,
        uploading: false,
    }
}

#[tokio::test]
async fn entries_list_oldest_first_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");

    {
        let q = RetryQueue::open(&path).await.unwrap();
        q.upsert(&task(30, 3_000)).await.unwrap();
        q.upsert(&task(10, 1_000)).await.unwrap();
        q.upsert(&task(20, 2_000)).await.unwrap();
    }

    let q = RetryQueue::open(&path).await.unwrap();
    let order: Vec<i64> = q
        .list_oldest_first()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.order_id)
        .collect();
    assert_eq!(order, vec![10, 20, 30]);

    q.delete(20).await.unwrap();
    let order: Vec<i64> = q
        .list_oldest_first()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.order_id)
        .collect();
    assert_eq!(order, vec![10, 30]);
    assert_eq!(q.count().await.unwrap(), 2);
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_order_id() {
    let dir = tempfile::tempdir().unwrap();
    let q = RetryQueue::open(&dir.path().join("queue.db")).await.unwrap();
    q.upsert(&task(9, 500)).await.unwrap();
    q.upsert(&task(4, 500)).await.unwrap();

    let order: Vec<i64> = q
        .list_oldest_first()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.order_id)
        .collect();
    assert_eq!(order, vec![4, 9]);
}

#[tokio::test]
async fn uploading_flag_persists_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    {
        let q = RetryQueue::open(&path).await.unwrap();
        q.upsert(&task(7, 1)).await.unwrap();
        assert!(q.try_mark_uploading(7).await.unwrap());
    }

    let q = RetryQueue::open(&path).await.unwrap();
    assert!(q.get(7).await.unwrap().unwrap().uploading);
    assert!(!q.try_mark_uploading(7).await.unwrap());
    assert_eq!(q.reset_stale_uploading().await.unwrap(), 1);
    assert!(q.try_mark_uploading(7).await.unwrap());
}
