//! A complete desk wired against an in-process server, on temp files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tch_conversion::{ConversionCoordinator, OrderStore};
use tch_render::{CertificateEngine, LayoutEngine, Renderer};
use tch_retry::RetryQueue;
use tch_schemas::{Handler, LockIntentRequest, NewIntentOrder, Order, OrderId, TargetFields};
use tempfile::TempDir;

use crate::engines::{fast_render_options, SilentEngine};
use crate::fixtures::{intent_with_items, jade_vase_target, scarlett};
use crate::remote::InProcessOrderService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Certificate,
    Silent,
}

pub struct TestDesk {
    dir: TempDir,
    engine: EngineKind,
    pub pool: SqlitePool,
    pub remote: Arc<InProcessOrderService>,
    pub coordinator: ConversionCoordinator,
}

impl TestDesk {
    /// Desk with the production certificate engine.
    pub async fn start() -> Result<Self> {
        Self::start_with(EngineKind::Certificate).await
    }

    pub async fn start_with(engine: EngineKind) -> Result<Self> {
        let dir = tempfile::tempdir().context("tempdir")?;
        let pool = tch_db::connect_file(&dir.path().join("orders.db")).await?;
        tch_db::migrate(&pool).await?;
        let remote = Arc::new(InProcessOrderService::new(
            pool.clone(),
            dir.path().join("uploads"),
        ));
        let coordinator = build_coordinator(dir.path(), engine, &remote).await?;
        Ok(Self {
            dir,
            engine,
            pool,
            remote,
            coordinator,
        })
    }

    /// Simulate process death: drop the coordinator and its in-memory store,
    /// then boot a fresh one over the same queue file and reload intents.
    pub async fn restart(&mut self) -> Result<()> {
        self.coordinator = build_coordinator(self.dir.path(), self.engine, &self.remote).await?;
        self.coordinator.refresh_intents(&scarlett()).await?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        self.coordinator.store()
    }

    pub fn queue(&self) -> &RetryQueue {
        self.coordinator.queue()
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.path().join("snapshots")
    }

    /// Insert an intent order on the server and pull it into the desk.
    pub async fn seed_intent(&self, id: OrderId, order: &NewIntentOrder) -> Result<()> {
        tch_db::insert_intent_with_id(&self.pool, id, order).await?;
        self.coordinator.refresh_intents(&scarlett()).await?;
        Ok(())
    }

    /// Seed an intent order and lock it as CONFIRMED through the coordinator.
    pub async fn seed_confirmed(&self, id: OrderId, items: usize, target: TargetFields) -> Result<Order> {
        self.seed_intent(id, &intent_with_items(items)).await?;
        self.lock(id, target, true).await?;
        self.store()
            .get(id)
            .await
            .with_context(|| format!("order {id} missing from store after lock"))
    }

    /// The end-to-end fixture: order with one Jade Vase line, locked.
    pub async fn seed_jade_vase(&self, id: OrderId) -> Result<Order> {
        self.seed_confirmed(id, 1, jade_vase_target()).await
    }

    pub async fn lock(&self, id: OrderId, target: TargetFields, confirm: bool) -> Result<()> {
        let handler = scarlett();
        self.coordinator
            .lock_intent(&LockIntentRequest {
                order_id: id,
                target,
                contact_method: None,
                confirm,
                handler_id: handler.id,
            })
            .await?;
        Ok(())
    }

    pub fn handler(&self) -> Handler {
        scarlett()
    }
}

async fn build_coordinator(
    dir: &Path,
    engine: EngineKind,
    remote: &Arc<InProcessOrderService>,
) -> Result<ConversionCoordinator> {
    let renderer = match engine {
        EngineKind::Certificate => start_renderer(CertificateEngine::new)?,
        EngineKind::Silent => start_renderer(|| SilentEngine)?,
    };
    let queue = RetryQueue::open(&dir.join("queue.db")).await?;
    let coordinator = ConversionCoordinator::new(
        Arc::new(OrderStore::new()),
        Arc::new(renderer),
        queue,
        Arc::clone(remote) as Arc<dyn tch_client::RemoteOrderService>,
        dir.join("snapshots"),
    )
    .await?;
    Ok(coordinator)
}

fn start_renderer<E, F>(factory: F) -> Result<Renderer>
where
    E: LayoutEngine + 'static,
    F: FnOnce() -> E + Send + 'static,
{
    Renderer::with_engine(factory, fast_render_options()).context("start renderer")
}
