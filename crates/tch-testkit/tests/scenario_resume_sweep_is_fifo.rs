//! After a restart the sweep resumes queued conversions oldest-first.
//!
//! GREEN when:
//! - tasks with createdAt t1 < t2 < t3 are finalized in that order, regardless of id
//! - stale `uploading` flags from the dead process do not block the sweep
//! - every resumed order is formal exactly once and the queue drains
//! - an entry whose snapshot file vanished fails without blocking the rest

use tch_conversion::ConversionError;
use tch_db::OrderLocation;
use tch_retry::RetrySnapshotTask;
use tch_schemas::OrderStage;
use tch_testkit::{EngineKind, FinalizeFault, TestDesk};

/// Render and checkpoint each order, but lose every upload.
async fn checkpoint_without_upload(desk: &TestDesk, ids: &[i64]) -> anyhow::Result<()> {
    for id in ids {
        desk.seed_jade_vase(*id).await?;
        desk.remote.inject(FinalizeFault::Transport);
        let err = desk.coordinator.start(*id, &desk.handler()).await.unwrap_err();
        assert!(err.is_retryable(), "order {id}: {err}");
    }
    Ok(())
}

#[tokio::test]
async fn restart_sweep_processes_oldest_first() -> anyhow::Result<()> {
    let mut desk = TestDesk::start().await?;
    checkpoint_without_upload(&desk, &[30, 10, 20]).await?;

    // Pin creation times so the oldest is not the lowest id; mark one as
    // mid-upload, as a process killed during the request would leave it.
    for (id, t) in [(20, 1_000), (30, 2_000), (10, 3_000)] {
        let mut task = desk.queue().get(id).await?.expect("entry");
        task.created_at_epoch_millis = t;
        desk.queue().upsert(&task).await?;
    }
    assert!(desk.queue().try_mark_uploading(30).await?);

    desk.restart().await?;
    let before = desk.remote.finalize_calls().len();

    let report = desk.coordinator.resume_pending(&desk.handler()).await?;
    assert_eq!(report.attempted, vec![20, 30, 10]);
    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert!(report.skipped_in_flight.is_empty());
    assert_eq!(report.completed.len(), 3);
    assert!(report.completed.iter().all(|o| !o.rendered));

    assert_eq!(desk.remote.finalize_calls()[before..], [20, 30, 10]);
    for id in [10, 20, 30] {
        assert_eq!(tch_db::locate_order(&desk.pool, id).await?, OrderLocation::Formal);
        assert_eq!(tch_db::count_formal_for_original(&desk.pool, id).await?, 1);
        assert_eq!(desk.store().get(id).await.unwrap().stage, OrderStage::Formal);
    }
    assert_eq!(desk.queue().count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn missing_snapshot_fails_its_entry_only() -> anyhow::Result<()> {
    let mut desk = TestDesk::start().await?;
    checkpoint_without_upload(&desk, &[1, 2]).await?;

    let gone = desk.queue().get(1).await?.expect("entry");
    std::fs::remove_file(&gone.local_snapshot_path)?;
    desk.queue()
        .upsert(&RetrySnapshotTask {
            created_at_epoch_millis: 1,
            ..gone
        })
        .await?;

    desk.restart().await?;
    let report = desk.coordinator.resume_pending(&desk.handler()).await?;
    assert_eq!(report.attempted, vec![1, 2]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0], (1, ConversionError::SnapshotUnreadable { .. })));
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].order_id, 2);

    // The stuck entry stays for the operator; the order is still retryable by re-rendering.
    assert!(desk.queue().get(1).await?.is_some());
    assert_eq!(tch_db::locate_order(&desk.pool, 1).await?, OrderLocation::Intent);
    let outcome = desk.coordinator.start(1, &desk.handler()).await?;
    assert!(outcome.rendered);
    assert_eq!(tch_db::locate_order(&desk.pool, 1).await?, OrderLocation::Formal);
    Ok(())
}

#[tokio::test]
async fn empty_queue_sweep_is_a_no_op() -> anyhow::Result<()> {
    let desk = TestDesk::start_with(EngineKind::Silent).await?;
    let report = desk.coordinator.resume_pending(&desk.handler()).await?;
    assert!(report.attempted.is_empty());
    assert!(desk.remote.finalize_calls().is_empty());
    Ok(())
}
