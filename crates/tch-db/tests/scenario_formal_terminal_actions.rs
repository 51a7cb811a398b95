//! Terminal handler actions on formal orders.

use tch_db::{SnapshotLocation, StoreError};
use tch_schemas::{
    FinalizeFields, Handler, LineItem, LockIntentRequest, NewIntentOrder, OrderStage,
    TargetFields,
};

async fn formal_order(pool: &sqlx::SqlitePool, id: i64) {
    tch_db::insert_intent_with_id(
        pool,
        id,
        &NewIntentOrder {
            contact_name: "Chen".to_string(),
            contact_method: Some("+86 138 0000 0000".to_string()),
            line_items: vec![LineItem {
                name: "Tea Set".to_string(),
                qty: 1,
                spec: None,
                note: None,
            }],
            handler_id: 6,
            suggestion: None,
        },
    )
    .await
    .unwrap();
    let target = TargetFields {
        gift_name: Some("Tea Set".to_string()),
        qty: 1,
        delivery_date: None,
    };
    tch_db::lock_intent_fields(
        pool,
        &LockIntentRequest {
            order_id: id,
            target: target.clone(),
            contact_method: None,
            confirm: true,
            handler_id: 6,
        },
    )
    .await
    .unwrap();
    tch_db::finalize_order(
        pool,
        &FinalizeFields {
            order_id: id,
            handler: Handler::new(6, "Wen"),
            target,
            contact_method: None,
            confirm: true,
        },
        &SnapshotLocation::default(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn complete_then_second_terminal_action_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = tch_db::connect_file(&dir.path().join("orders.db")).await.unwrap();
    tch_db::migrate(&pool).await.unwrap();
    formal_order(&pool, 21).await;

    let closed = tch_db::close_formal_order(&pool, 21, OrderStage::Completed, 6)
        .await
        .unwrap();
    assert_eq!(closed.status, OrderStage::Completed);

    let err = tch_db::close_formal_order(&pool, 21, OrderStage::Terminated, 6)
        .await
        .unwrap_err();
    assert!(
        matches!(err, StoreError::AlreadyClosed { status: OrderStage::Completed, .. }),
        "got: {err}"
    );

    let listed = tch_db::list_formal_orders(&pool).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, OrderStage::Completed);
}

#[tokio::test]
async fn non_terminal_status_and_foreign_handler_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pool = tch_db::connect_file(&dir.path().join("orders.db")).await.unwrap();
    tch_db::migrate(&pool).await.unwrap();
    formal_order(&pool, 22).await;

    let err = tch_db::close_formal_order(&pool, 22, OrderStage::Confirmed, 6)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));

    let err = tch_db::close_formal_order(&pool, 22, OrderStage::Terminated, 99)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));

    let err = tch_db::close_formal_order(&pool, 404, OrderStage::Terminated, 6)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(404)));

    let row = tch_db::fetch_formal_by_original(&pool, 22).await.unwrap().unwrap();
    assert_eq!(row.status, OrderStage::Formal);
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pool = tch_db::connect_file(&dir.path().join("orders.db")).await.unwrap();
    tch_db::migrate(&pool).await.unwrap();
    tch_db::migrate(&pool).await.unwrap();
    assert!(tch_db::list_formal_orders(&pool).await.unwrap().is_empty());
}
