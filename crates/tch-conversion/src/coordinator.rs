//! Conversion Coordinator: Render → checkpoint → Upload → Server-Finalize.
//!
//! The retry queue entry written after a successful render is the durability
//! checkpoint. Everything after it is safe to repeat, because the server
//! migration is idempotent and a failed attempt leaves the intent record
//! intact. The entry is removed only once the server confirms the migration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tch_client::{RemoteOrderService, UploadSignal};
use tch_render::{write_snapshot, Renderer};
use tch_retry::{RetryQueue, RetrySnapshotTask};
use tch_schemas::{
    FinalizeFields, Handler, LockIntentAck, LockIntentRequest, MigrationReceipt, Order, OrderId,
    OrderStage, SnapshotUpload,
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::order_store::{OrderStore, StageError};
use crate::state::{ConversionError, ConversionEvent, ConversionState};

/// Outcome of a conversion that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutcome {
    pub order_id: OrderId,
    pub attempt_id: Uuid,
    pub formal_id: i64,
    /// The server reported the order as migrated by an earlier attempt.
    pub already_migrated: bool,
    /// `false` when the attempt resumed from an existing checkpoint.
    pub rendered: bool,
    pub snapshot_path: PathBuf,
    pub snapshot_url: Option<String>,
}

/// Result of one resume sweep, in processing order.
#[derive(Debug, Default)]
pub struct ResumeReport {
    /// Order ids in the order they were attempted.
    pub attempted: Vec<OrderId>,
    pub completed: Vec<ConversionOutcome>,
    pub failed: Vec<(OrderId, ConversionError)>,
    /// Entries skipped because a conversion for that order was already running.
    pub skipped_in_flight: Vec<OrderId>,
}

// ---------------------------------------------------------------------------
// Per-order lock
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct InFlight {
    ids: Arc<Mutex<HashSet<OrderId>>>,
}

/// Held for the lifetime of one conversion; releases the order on drop.
struct Lease {
    ids: Arc<Mutex<HashSet<OrderId>>>,
    order_id: OrderId,
}

impl InFlight {
    fn try_acquire(&self, order_id: OrderId) -> Option<Lease> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(order_id) {
            return None;
        }
        Some(Lease {
            ids: Arc::clone(&self.ids),
            order_id,
        })
    }

    fn contains(&self, order_id: OrderId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&order_id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.order_id);
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

struct Attempt {
    order_id: OrderId,
    id: Uuid,
    state: ConversionState,
    events: broadcast::Sender<ConversionEvent>,
}

impl Attempt {
    fn new(order_id: OrderId, events: broadcast::Sender<ConversionEvent>) -> Self {
        let attempt = Self {
            order_id,
            id: Uuid::new_v4(),
            state: ConversionState::Idle,
            events,
        };
        attempt.emit();
        attempt
    }

    fn emit(&self) {
        // No subscribers is fine.
        let _ = self.events.send(ConversionEvent {
            order_id: self.order_id,
            attempt_id: self.id,
            state: self.state.clone(),
            ts_millis: Utc::now().timestamp_millis(),
        });
    }

    fn advance(&mut self, next: ConversionState) {
        if !self.state.can_transition_to(&next) {
            error!(
                order_id = self.order_id,
                from = ?self.state,
                to = ?next,
                "illegal conversion transition"
            );
        }
        info!(order_id = self.order_id, attempt_id = %self.id, state = ?next, "conversion state");
        self.state = next;
        self.emit();
    }

    fn fail(&mut self, err: ConversionError) -> ConversionError {
        warn!(order_id = self.order_id, attempt_id = %self.id, error = %err, "conversion failed");
        self.advance(ConversionState::Failed {
            reason: err.to_string(),
            retryable: err.is_retryable(),
        });
        err
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ConversionCoordinator {
    store: Arc<OrderStore>,
    renderer: Arc<Renderer>,
    queue: RetryQueue,
    remote: Arc<dyn RemoteOrderService>,
    snapshot_dir: PathBuf,
    in_flight: InFlight,
    events: broadcast::Sender<ConversionEvent>,
}

impl ConversionCoordinator {
    /// Build a coordinator that owns `queue` for this process.
    ///
    /// `uploading` flags left set by a previous process are cleared here,
    /// before any conversion can run.
    pub async fn new(
        store: Arc<OrderStore>,
        renderer: Arc<Renderer>,
        queue: RetryQueue,
        remote: Arc<dyn RemoteOrderService>,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConversionError> {
        queue.reset_stale_uploading().await.map_err(queue_failure)?;
        let (events, _rx) = broadcast::channel(256);
        Ok(Self {
            store,
            renderer,
            queue,
            remote,
            snapshot_dir: snapshot_dir.into(),
            in_flight: InFlight::default(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn is_in_flight(&self, order_id: OrderId) -> bool {
        self.in_flight.contains(order_id)
    }

    /// Pull the handler's intent list from the server into the order store.
    ///
    /// Returns how many orders were accepted. Rows the store refuses (already
    /// formal here) are skipped.
    pub async fn refresh_intents(&self, handler: &Handler) -> Result<usize, ConversionError> {
        let orders = self.remote.fetch_intent_list(handler.id).await?;
        let mut accepted = 0;
        for order in orders {
            let order_id = order.id;
            match self.store.upsert_intent(order).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!(order_id, error = %e, "skipping intent row"),
            }
        }
        info!(handler_id = handler.id, accepted, "intent list refreshed");
        Ok(accepted)
    }

    /// Lock (or draft-save) the intent fields on the server, then mirror it locally.
    pub async fn lock_intent(&self, req: &LockIntentRequest) -> Result<LockIntentAck, ConversionError> {
        if let Some(order) = self.store.get(req.order_id).await {
            if !order.stage.target_fields_mutable() {
                return Err(StageError::Frozen {
                    order_id: req.order_id,
                    stage: order.stage,
                }
                .into());
            }
        }
        let ack = self.remote.lock_intent_fields(req).await?;
        let confirmed = ack.stage == OrderStage::Confirmed;
        match self
            .store
            .apply_lock(req.order_id, req.target.clone(), req.contact_method.clone(), confirmed)
            .await
        {
            Ok(_) | Err(StageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(order_id = req.order_id, stage = %ack.stage, "intent fields locked");
        Ok(ack)
    }

    /// Convert one confirmed order.
    ///
    /// Rejected with [`ConversionError::AlreadyInFlight`] while another
    /// conversion of the same order runs. If a checkpoint with a readable
    /// snapshot already exists, rendering is skipped.
    pub async fn start(
        &self,
        order_id: OrderId,
        handler: &Handler,
    ) -> Result<ConversionOutcome, ConversionError> {
        let _lease = self
            .in_flight
            .try_acquire(order_id)
            .ok_or(ConversionError::AlreadyInFlight(order_id))?;

        let order = self
            .store
            .get(order_id)
            .await
            .ok_or(StageError::NotFound(order_id))?;
        if order.stage != OrderStage::Confirmed {
            return Err(ConversionError::NotConfirmed {
                order_id,
                stage: order.stage,
            });
        }

        let mut attempt = Attempt::new(order_id, self.events.clone());

        let checkpoint = match self.queue.get(order_id).await {
            Ok(task) => task,
            Err(e) => return Err(attempt.fail(queue_failure(e))),
        };
        let (path, rendered) = match checkpoint {
            Some(task) if is_readable(&task.local_snapshot_path).await => {
                info!(order_id, path = %task.local_snapshot_path.display(), "resuming from checkpoint");
                (task.local_snapshot_path, false)
            }
            _ => {
                let stamped = stamp_handler(&order, handler);
                (self.render_and_checkpoint(&mut attempt, &stamped).await?, true)
            }
        };

        let fields = finalize_fields(&order, handler);
        self.upload_and_finalize(&mut attempt, fields, path, rendered)
            .await
    }

    /// Resume every queued conversion, oldest entry first, one at a time.
    ///
    /// Entries whose order is already converting are skipped. Failures are
    /// collected and the sweep continues with the next entry.
    pub async fn resume_pending(&self, handler: &Handler) -> Result<ResumeReport, ConversionError> {
        let tasks = self.queue.list_oldest_first().await.map_err(queue_failure)?;
        info!(count = tasks.len(), handler_id = handler.id, "resume sweep");

        let mut report = ResumeReport::default();
        for task in tasks {
            let order_id = task.order_id;
            let Some(_lease) = self.in_flight.try_acquire(order_id) else {
                report.skipped_in_flight.push(order_id);
                continue;
            };
            report.attempted.push(order_id);

            match self.resume_one(task, handler).await {
                Ok(outcome) => report.completed.push(outcome),
                Err(e) => report.failed.push((order_id, e)),
            }
        }
        Ok(report)
    }

    async fn resume_one(
        &self,
        task: RetrySnapshotTask,
        handler: &Handler,
    ) -> Result<ConversionOutcome, ConversionError> {
        let order_id = task.order_id;
        let mut attempt = Attempt::new(order_id, self.events.clone());

        let fields = match self.store.get(order_id).await {
            Some(order) => finalize_fields(&order, handler),
            // The server copies target fields from its locked intent row.
            None => FinalizeFields {
                order_id,
                handler: handler.clone(),
                target: Default::default(),
                contact_method: None,
                confirm: true,
            },
        };

        if !is_readable(&task.local_snapshot_path).await {
            return Err(attempt.fail(ConversionError::SnapshotUnreadable {
                order_id,
                path: task.local_snapshot_path.display().to_string(),
                reason: "file missing or empty".to_string(),
            }));
        }

        self.upload_and_finalize(&mut attempt, fields, task.local_snapshot_path, false)
            .await
    }

    async fn render_and_checkpoint(
        &self,
        attempt: &mut Attempt,
        order: &Order,
    ) -> Result<PathBuf, ConversionError> {
        attempt.advance(ConversionState::Rendering);

        let snapshot = match self.renderer.render(order).await {
            Ok(s) => s,
            Err(e) => return Err(attempt.fail(e.into())),
        };
        let path = match write_snapshot(&self.snapshot_dir, &snapshot).await {
            Ok(p) => p,
            Err(e) => return Err(attempt.fail(e.into())),
        };

        if let Err(e) = self
            .queue
            .upsert(&RetrySnapshotTask::new(order.id, path.clone()))
            .await
        {
            return Err(attempt.fail(queue_failure(e)));
        }
        Ok(path)
    }

    async fn upload_and_finalize(
        &self,
        attempt: &mut Attempt,
        fields: FinalizeFields,
        path: PathBuf,
        rendered: bool,
    ) -> Result<ConversionOutcome, ConversionError> {
        let order_id = fields.order_id;
        attempt.advance(ConversionState::Uploading);

        match self.queue.try_mark_uploading(order_id).await {
            Ok(true) => {}
            Ok(false) => return Err(attempt.fail(ConversionError::AlreadyInFlight(order_id))),
            Err(e) => return Err(attempt.fail(queue_failure(e))),
        }

        let result = self.finalize_remote(attempt, &fields, &path).await;

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                if let Err(qe) = self.queue.clear_uploading(order_id).await {
                    warn!(order_id, error = %qe, "failed to clear uploading flag");
                }
                return Err(attempt.fail(e));
            }
        };

        // The server has committed. A failed delete only means the next sweep
        // finalizes again and receives `already_migrated`.
        if let Err(e) = self.queue.delete(order_id).await {
            warn!(order_id, error = %e, "failed to clear retry entry after migration");
        }

        let receipt = MigrationReceipt::from_finalize_ack(&ack);
        match self.store.mark_formal(&receipt).await {
            Ok(_) | Err(StageError::NotFound(_)) => {}
            Err(e) => warn!(order_id, error = %e, "order store disagrees with server migration"),
        }

        attempt.advance(ConversionState::Done);
        info!(
            order_id,
            formal_id = ack.formal_id,
            already_migrated = ack.already_migrated,
            "order converted"
        );

        Ok(ConversionOutcome {
            order_id,
            attempt_id: attempt.id,
            formal_id: ack.formal_id,
            already_migrated: ack.already_migrated,
            rendered,
            snapshot_path: path,
            snapshot_url: ack.snapshot_url,
        })
    }

    async fn finalize_remote(
        &self,
        attempt: &mut Attempt,
        fields: &FinalizeFields,
        path: &Path,
    ) -> Result<tch_schemas::FinalizeAck, ConversionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ConversionError::SnapshotUnreadable {
                order_id: fields.order_id,
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let upload = SnapshotUpload {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("order_{}.png", fields.order_id)),
            local_path: path.display().to_string(),
            bytes,
        };

        let (signal, mut uploaded_rx) = UploadSignal::channel();
        let call = self.remote.finalize(fields, upload, signal);
        tokio::pin!(call);

        let mut uploaded = false;
        let result = loop {
            tokio::select! {
                res = &mut call => break res,
                sig = &mut uploaded_rx, if !uploaded => {
                    uploaded = true;
                    if sig.is_ok() {
                        attempt.advance(ConversionState::ServerFinalizing);
                    }
                }
            }
        };

        let ack = result?;
        if attempt.state == ConversionState::Uploading {
            attempt.advance(ConversionState::ServerFinalizing);
        }
        Ok(ack)
    }
}

fn finalize_fields(order: &Order, handler: &Handler) -> FinalizeFields {
    FinalizeFields {
        order_id: order.id,
        handler: handler.clone(),
        target: order.target.clone(),
        contact_method: order.contact_method.clone(),
        confirm: true,
    }
}

/// The certificate names the handler running the conversion.
fn stamp_handler(order: &Order, handler: &Handler) -> Order {
    Order {
        handler_id: handler.id,
        handler_name: Some(handler.name.clone()),
        ..order.clone()
    }
}

fn queue_failure(e: anyhow::Error) -> ConversionError {
    ConversionError::QueueFailure(format!("{e:#}"))
}

async fn is_readable(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(m) if m.is_file() && m.len() > 0)
}
