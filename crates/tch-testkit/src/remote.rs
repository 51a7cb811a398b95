//! In-process Remote Order Service with fault injection.
//!
//! Runs the same store operations the daemon runs, without HTTP, so scenario
//! tests can force failures at precise points of the finalize call.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use sqlx::SqlitePool;
use tch_client::{RemoteError, RemoteOrderService, UploadSignal};
use tch_db::{FaultPoint, SnapshotLocation, StoreError};
use tch_schemas::{
    FinalizeAck, FinalizeFields, FormalOrder, LockIntentAck, LockIntentRequest, Order, OrderId,
    SnapshotUpload,
};
use tokio::sync::{Notify, Semaphore};
use tracing::info;
use uuid::Uuid;

/// A failure to inject into the next finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeFault {
    /// The connection drops before the server sees the request.
    Transport,
    /// The migration transaction aborts at the given step and rolls back.
    Transaction(FaultPoint),
    /// The server commits but the response never reaches the desk.
    LostResponse,
}

/// Parks finalize calls until released. See [`InProcessOrderService::hold_finalize`].
#[derive(Clone)]
pub struct FinalizeHold {
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

impl FinalizeHold {
    /// Wait until a finalize call is parked on this hold.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let every parked and future finalize call through.
    pub fn release(&self) {
        self.release.add_permits(1024);
    }
}

pub struct InProcessOrderService {
    pool: SqlitePool,
    upload_dir: PathBuf,
    public_base_url: String,
    faults: Mutex<VecDeque<FinalizeFault>>,
    hold: Mutex<Option<FinalizeHold>>,
    finalize_calls: Mutex<Vec<OrderId>>,
}

impl InProcessOrderService {
    pub fn new(pool: SqlitePool, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            upload_dir: upload_dir.into(),
            public_base_url: "http://files.test".to_string(),
            faults: Mutex::new(VecDeque::new()),
            hold: Mutex::new(None),
            finalize_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Queue a fault; each finalize call consumes at most one.
    pub fn inject(&self, fault: FinalizeFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(fault);
    }

    /// Park every finalize call until the returned hold is released.
    pub fn hold_finalize(&self) -> FinalizeHold {
        let hold = FinalizeHold {
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        };
        *self.hold.lock().unwrap_or_else(PoisonError::into_inner) = Some(hold.clone());
        hold
    }

    /// Order ids of every finalize call received, in arrival order.
    pub fn finalize_calls(&self) -> Vec<OrderId> {
        self.finalize_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn upload_dir(&self) -> &PathBuf {
        &self.upload_dir
    }

    fn next_fault(&self) -> Option<FinalizeFault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn store_upload(&self, order_id: OrderId, bytes: &[u8]) -> Result<(PathBuf, String), RemoteError> {
        let upload_id = Uuid::new_v4().simple().to_string();
        let name = tch_db::stored_snapshot_name(order_id, Utc::now().timestamp(), &upload_id);
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| server_error(e.to_string()))?;
        let path = self.upload_dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| server_error(e.to_string()))?;
        Ok((path, format!("{}/{}", self.public_base_url, name)))
    }
}

fn server_error(message: String) -> RemoteError {
    RemoteError::Server {
        status: 500,
        message,
    }
}

fn remote_error(e: StoreError) -> RemoteError {
    match e {
        StoreError::NotFound(_) => RemoteError::Rejected {
            status: 404,
            message: e.to_string(),
        },
        e if e.is_validation() => RemoteError::Rejected {
            status: 422,
            message: e.to_string(),
        },
        e => server_error(e.to_string()),
    }
}

fn anyhow_error(e: anyhow::Error) -> RemoteError {
    server_error(format!("{e:#}"))
}

#[async_trait::async_trait]
impl RemoteOrderService for InProcessOrderService {
    async fn lock_intent_fields(&self, req: &LockIntentRequest) -> Result<LockIntentAck, RemoteError> {
        tch_db::lock_intent_fields(&self.pool, req)
            .await
            .map_err(remote_error)
    }

    async fn finalize(
        &self,
        fields: &FinalizeFields,
        snapshot: SnapshotUpload,
        mut progress: UploadSignal,
    ) -> Result<FinalizeAck, RemoteError> {
        let order_id = fields.order_id;
        self.finalize_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(order_id);

        let hold = self
            .hold
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            let _permit = hold.release.acquire().await;
        }

        let fault = self.next_fault();
        if fault == Some(FinalizeFault::Transport) {
            info!(order_id, "injected transport failure");
            return Err(RemoteError::Transport("injected: connection reset".to_string()));
        }
        progress.uploaded();

        if let Some(existing) = tch_db::fetch_formal_by_original(&self.pool, order_id)
            .await
            .map_err(anyhow_error)?
        {
            return Ok(FinalizeAck {
                order_id,
                formal_id: existing.id,
                already_migrated: true,
                snapshot_url: existing.snapshot_url,
            });
        }

        let (stored, url) = self.store_upload(order_id, &snapshot.bytes).await?;
        let location = SnapshotLocation {
            url: Some(url),
            local_path: Some(snapshot.local_path.clone()),
        };

        let result = match fault {
            Some(FinalizeFault::Transaction(at)) => {
                tch_db::finalize_order_with_fault(&self.pool, fields, &location, at).await
            }
            _ => tch_db::finalize_order(&self.pool, fields, &location).await,
        };

        match result {
            Ok(_) if fault == Some(FinalizeFault::LostResponse) => {
                info!(order_id, "injected lost response after commit");
                Err(RemoteError::Transport("injected: response lost".to_string()))
            }
            Ok(ack) => {
                if ack.already_migrated && ack.snapshot_url != location.url {
                    let _ = tokio::fs::remove_file(&stored).await;
                }
                Ok(ack)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&stored).await;
                Err(remote_error(e))
            }
        }
    }

    async fn fetch_intent_list(&self, handler_id: i64) -> Result<Vec<Order>, RemoteError> {
        tch_db::list_intents_for_handler(&self.pool, handler_id)
            .await
            .map_err(anyhow_error)
    }

    async fn fetch_formal_list(&self) -> Result<Vec<FormalOrder>, RemoteError> {
        tch_db::list_formal_orders(&self.pool)
            .await
            .map_err(anyhow_error)
    }
}
