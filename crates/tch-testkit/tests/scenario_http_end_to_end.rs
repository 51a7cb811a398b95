//! The desk talks to a real daemon over loopback HTTP.
//!
//! GREEN when:
//! - intent listing and locking go through the daemon's JSON endpoints
//! - a conversion uploads the certificate as multipart and lands one formal row
//! - the stored certificate is served back under /files as a PNG
//! - a second finalize for the same order reports already_migrated

use std::sync::Arc;

use tch_client::{HttpOrderService, RemoteOrderService, UploadSignal};
use tch_conversion::{ConversionCoordinator, OrderStore};
use tch_daemon::{routes, state};
use tch_render::Renderer;
use tch_retry::RetryQueue;
use tch_schemas::{LockIntentRequest, OrderStage, SnapshotUpload};
use tch_testkit::{fast_render_options, intent_with_items, jade_vase_target, scarlett};
use tokio::net::TcpListener;

struct LiveDaemon {
    _dir: tempfile::TempDir,
    dir: std::path::PathBuf,
    base_url: String,
    pool: sqlx::SqlitePool,
}

impl LiveDaemon {
    async fn spawn() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let pool = tch_db::connect_file(&dir.path().join("orders.db")).await?;
        tch_db::migrate(&pool).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let uploads = state::UploadStore::new(dir.path().join("uploads"), &format!("{base_url}/files"));
        let app = routes::build_router(Arc::new(state::AppState::new(pool.clone(), uploads)));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            dir: dir.path().to_path_buf(),
            _dir: dir,
            base_url,
            pool,
        })
    }

    fn client(&self) -> HttpOrderService {
        HttpOrderService::with_client(reqwest::Client::new(), self.base_url.clone())
    }

    async fn desk(&self) -> anyhow::Result<ConversionCoordinator> {
        let renderer = Renderer::start(fast_render_options())?;
        let queue = RetryQueue::open(&self.dir.join("queue.db")).await?;
        Ok(ConversionCoordinator::new(
            Arc::new(OrderStore::new()),
            Arc::new(renderer),
            queue,
            Arc::new(self.client()),
            self.dir.join("snapshots"),
        )
        .await?)
    }
}

#[tokio::test]
async fn conversion_over_http_lands_one_formal_row() -> anyhow::Result<()> {
    let daemon = LiveDaemon::spawn().await?;
    tch_db::insert_intent_with_id(&daemon.pool, 7, &intent_with_items(1)).await?;

    let client = daemon.client();
    let visible = client.fetch_intent_list(scarlett().id).await?;
    assert_eq!(visible.iter().map(|o| o.id).collect::<Vec<_>>(), vec![7]);

    let desk = daemon.desk().await?;
    assert_eq!(desk.refresh_intents(&scarlett()).await?, 1);
    desk.lock_intent(&LockIntentRequest {
        order_id: 7,
        target: jade_vase_target(),
        contact_method: None,
        confirm: true,
        handler_id: scarlett().id,
    })
    .await?;

    let outcome = desk.start(7, &scarlett()).await?;
    assert!(outcome.rendered);
    assert!(!outcome.already_migrated);
    assert_eq!(desk.queue().count().await?, 0);

    let formal = client.fetch_formal_list().await?;
    assert_eq!(formal.len(), 1);
    assert_eq!(formal[0].original_order_id, 7);
    assert_eq!(formal[0].status, OrderStage::Formal);
    assert_eq!(formal[0].target.gift_name.as_deref(), Some("Jade Vase"));
    assert_eq!(formal[0].handler_name, "Scarlett");
    assert!(client.fetch_intent_list(scarlett().id).await?.is_empty());

    let url = outcome.snapshot_url.clone().expect("snapshot url");
    assert!(url.starts_with(&format!("{}/files/formal_7_", daemon.base_url)), "{url}");
    let served = reqwest::get(&url).await?.error_for_status()?.bytes().await?;
    assert_eq!(&served[..8], b"\x89PNG\r\n\x1a\n");
    assert_eq!(served.len() as u64, std::fs::metadata(&outcome.snapshot_path)?.len());
    Ok(())
}

#[tokio::test]
async fn repeated_finalize_over_http_is_a_no_op() -> anyhow::Result<()> {
    let daemon = LiveDaemon::spawn().await?;
    tch_db::insert_intent_with_id(&daemon.pool, 12, &intent_with_items(2)).await?;
    let desk = daemon.desk().await?;
    desk.refresh_intents(&scarlett()).await?;
    desk.lock_intent(&LockIntentRequest {
        order_id: 12,
        target: jade_vase_target(),
        contact_method: None,
        confirm: true,
        handler_id: scarlett().id,
    })
    .await?;
    let first = desk.start(12, &scarlett()).await?;

    let fields = tch_schemas::FinalizeFields {
        order_id: 12,
        handler: scarlett(),
        target: jade_vase_target(),
        contact_method: None,
        confirm: true,
    };
    let upload = SnapshotUpload {
        file_name: "order_12.png".to_string(),
        bytes: std::fs::read(&first.snapshot_path)?,
        local_path: first.snapshot_path.display().to_string(),
    };
    let ack = daemon
        .client()
        .finalize(&fields, upload, UploadSignal::none())
        .await?;
    assert!(ack.already_migrated);
    assert_eq!(ack.formal_id, first.formal_id);
    assert_eq!(ack.snapshot_url, first.snapshot_url);
    assert_eq!(tch_db::count_formal_for_original(&daemon.pool, 12).await?, 1);
    assert_eq!(std::fs::read_dir(daemon.dir.join("uploads"))?.count(), 1);
    Ok(())
}
