//! Failures after the checkpoint keep the retry entry and the intent row.
//!
//! GREEN when:
//! - a transport failure yields a retryable UploadNetworkFailure, entry preserved
//! - a transaction abort at any step leaves the order fully in the intent store,
//!   with no formal row and no notification
//! - the next start() resumes from Uploading without re-rendering
//! - a commit whose response was lost resolves to `already_migrated` on retry,
//!   with exactly one formal row

use tch_conversion::{ConversionError, ConversionState};
use tch_db::{FaultPoint, OrderLocation};
use tch_schemas::OrderStage;
use tch_testkit::{jade_vase_target, FinalizeFault, TestDesk};

#[tokio::test]
async fn transport_failure_preserves_checkpoint_and_retry_skips_render() -> anyhow::Result<()> {
    let desk = TestDesk::start().await?;
    desk.seed_jade_vase(7).await?;
    desk.remote.inject(FinalizeFault::Transport);

    let err = desk.coordinator.start(7, &desk.handler()).await.unwrap_err();
    assert!(matches!(err, ConversionError::UploadNetworkFailure(_)), "got: {err}");
    assert!(err.is_retryable());

    let task = desk.queue().get(7).await?.expect("retry entry preserved");
    assert!(!task.uploading, "flag released after the failed attempt");
    assert!(task.local_snapshot_path.exists());
    assert_eq!(tch_db::locate_order(&desk.pool, 7).await?, OrderLocation::Intent);
    assert_eq!(desk.store().get(7).await.unwrap().stage, OrderStage::Confirmed);

    let mut events = desk.coordinator.subscribe();
    let outcome = desk.coordinator.start(7, &desk.handler()).await?;
    assert!(!outcome.rendered, "resumed from the checkpoint");
    assert_eq!(outcome.snapshot_path, task.local_snapshot_path);
    assert!(!outcome.already_migrated);

    let states: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.state)
        .collect();
    assert!(!states.contains(&ConversionState::Rendering), "states: {states:?}");

    assert_eq!(desk.queue().count().await?, 0);
    assert_eq!(tch_db::locate_order(&desk.pool, 7).await?, OrderLocation::Formal);
    Ok(())
}

#[tokio::test]
async fn aborted_transaction_leaves_order_in_intent_store() -> anyhow::Result<()> {
    let desk = TestDesk::start().await?;
    let points = [
        FaultPoint::AfterFormalInsert,
        FaultPoint::AfterNotification,
        FaultPoint::BeforeCommit,
    ];

    for (i, point) in points.into_iter().enumerate() {
        let id = 70 + i as i64;
        desk.seed_jade_vase(id).await?;
        let before = tch_db::fetch_intent(&desk.pool, id).await?.expect("intent row");

        desk.remote.inject(FinalizeFault::Transaction(point));
        let err = desk.coordinator.start(id, &desk.handler()).await.unwrap_err();
        assert!(
            matches!(err, ConversionError::ServerTransactionFailure(_)),
            "{point:?}: got {err}"
        );
        assert!(err.is_retryable());

        assert_eq!(tch_db::locate_order(&desk.pool, id).await?, OrderLocation::Intent);
        let after = tch_db::fetch_intent(&desk.pool, id).await?.expect("intent row");
        assert_eq!(after, before, "{point:?}: intent row modified");
        assert!(tch_db::list_notifications_for_order(&desk.pool, id).await?.is_empty());
        assert!(desk.queue().get(id).await?.is_some());
        assert_eq!(std::fs::read_dir(desk.remote.upload_dir())?.count(), 0, "orphan upload kept");

        let outcome = desk.coordinator.start(id, &desk.handler()).await?;
        assert!(!outcome.rendered);
        assert_eq!(tch_db::count_formal_for_original(&desk.pool, id).await?, 1);
        assert_eq!(tch_db::list_notifications_for_order(&desk.pool, id).await?.len(), 1);
        for entry in std::fs::read_dir(desk.remote.upload_dir())? {
            std::fs::remove_file(entry?.path())?;
        }
    }
    Ok(())
}

#[tokio::test]
async fn lost_response_is_resolved_as_already_migrated() -> anyhow::Result<()> {
    let desk = TestDesk::start().await?;
    desk.seed_jade_vase(7).await?;
    desk.remote.inject(FinalizeFault::LostResponse);

    let err = desk.coordinator.start(7, &desk.handler()).await.unwrap_err();
    assert!(err.is_retryable());
    // The server committed; the desk does not know yet.
    assert_eq!(tch_db::locate_order(&desk.pool, 7).await?, OrderLocation::Formal);
    assert!(desk.queue().get(7).await?.is_some());
    assert_eq!(desk.store().get(7).await.unwrap().stage, OrderStage::Confirmed);

    let outcome = desk.coordinator.start(7, &desk.handler()).await?;
    assert!(outcome.already_migrated);
    assert!(!outcome.rendered);
    assert_eq!(tch_db::count_formal_for_original(&desk.pool, 7).await?, 1);
    assert_eq!(tch_db::list_notifications_for_order(&desk.pool, 7).await?.len(), 1);
    assert_eq!(desk.queue().count().await?, 0);
    assert_eq!(desk.store().get(7).await.unwrap().stage, OrderStage::Formal);
    Ok(())
}

#[tokio::test]
async fn server_validation_failure_is_not_retryable() -> anyhow::Result<()> {
    let desk = TestDesk::start().await?;
    desk.seed_jade_vase(7).await?;
    // Another desk reopens the order as a draft on the server between lock and convert.
    sqlx::query("update intent_orders set intent_confirm_status = 0, stage = 'INTENT' where id = 7")
        .execute(&desk.pool)
        .await?;

    let err = desk.coordinator.start(7, &desk.handler()).await.unwrap_err();
    assert!(matches!(err, ConversionError::ServerValidationFailure(_)), "got: {err}");
    assert!(!err.is_retryable());
    assert_eq!(tch_db::locate_order(&desk.pool, 7).await?, OrderLocation::Intent);

    // Operator fixes the state and retries.
    desk.lock(7, jade_vase_target(), true).await?;
    let outcome = desk.coordinator.start(7, &desk.handler()).await?;
    assert!(!outcome.rendered);
    assert_eq!(tch_db::locate_order(&desk.pool, 7).await?, OrderLocation::Formal);
    Ok(())
}
