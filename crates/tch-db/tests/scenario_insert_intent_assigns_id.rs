//! Inbound intent orders get a database-assigned id and are readable at once.
//!
//! GREEN when:
//! - `insert_intent` returns the stored row, stage INTENT, with its line items
//! - consecutive inserts get increasing ids and both are listed for the handler
//! - ids assigned after an explicit-id import never reuse a migrated id
//! - invalid orders are refused before anything is written

use sqlx::SqlitePool;
use tch_db::{OrderLocation, StoreError};
use tch_schemas::{LineItem, NewIntentOrder, OrderStage};

async fn fresh_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let pool = tch_db::connect_file(&dir.path().join("orders.db"))
        .await
        .expect("connect");
    tch_db::migrate(&pool).await.expect("migrate");
    pool
}

fn tea_set(handler_id: i64) -> NewIntentOrder {
    NewIntentOrder {
        contact_name: "Mei Lin".to_string(),
        contact_method: Some("phone: 555-0101".to_string()),
        line_items: vec![
            LineItem {
                name: "Porcelain Tea Set".to_string(),
                qty: 1,
                spec: Some("6 cups".to_string()),
                note: None,
            },
            LineItem {
                name: "Oolong Sampler".to_string(),
                qty: 3,
                spec: None,
                note: Some("vacuum packed".to_string()),
            },
        ],
        handler_id,
        suggestion: Some("Pair with a bamboo tray".to_string()),
    }
}

#[tokio::test]
async fn insert_returns_the_stored_row() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir).await;

    let order = tch_db::insert_intent(&pool, &tea_set(4)).await.unwrap();
    assert!(order.id > 0);
    assert_eq!(order.stage, OrderStage::Intent);
    assert_eq!(order.contact_name, "Mei Lin");
    assert_eq!(order.line_items.len(), 2);
    assert_eq!(order.line_items[1].qty, 3);
    assert_eq!(order.handler_id, 4);
    assert_eq!(order.suggestion.as_deref(), Some("Pair with a bamboo tray"));

    let fetched = tch_db::fetch_intent(&pool, order.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, order.id);
    assert_eq!(
        tch_db::locate_order(&pool, order.id).await.unwrap(),
        OrderLocation::Intent
    );
}

#[tokio::test]
async fn consecutive_inserts_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir).await;

    let first = tch_db::insert_intent(&pool, &tea_set(4)).await.unwrap();
    let second = tch_db::insert_intent(&pool, &tea_set(4)).await.unwrap();
    assert!(second.id > first.id);

    let listed = tch_db::list_intents_for_handler(&pool, 4).await.unwrap();
    let ids: Vec<i64> = listed.iter().map(|o| o.id).collect();
    assert!(ids.contains(&first.id));
    assert!(ids.contains(&second.id));
}

#[tokio::test]
async fn assigned_ids_continue_after_imported_ids() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir).await;

    tch_db::insert_intent_with_id(&pool, 500, &tea_set(4)).await.unwrap();
    let next = tch_db::insert_intent(&pool, &tea_set(4)).await.unwrap();
    assert!(next.id > 500, "got {}", next.id);
}

#[tokio::test]
async fn invalid_order_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fresh_pool(&dir).await;

    let mut empty = tea_set(4);
    empty.line_items.clear();
    let err = tch_db::insert_intent(&pool, &empty).await.unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)), "{err:?}");
    assert!(tch_db::list_intents_for_handler(&pool, 4).await.unwrap().is_empty());
}
