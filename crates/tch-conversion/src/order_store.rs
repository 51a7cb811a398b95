//! In-memory Order Store.
//!
//! Holds the desk's view of each order and enforces the stage lifecycle:
//!
//! ```text
//! Intent ──lock──► Confirmed ──receipt──► Formal ──close──► Completed | Terminated
//! ```
//!
//! Target fields are writable only while Intent or Confirmed. `Formal` is set
//! only by [`OrderStore::mark_formal`], which requires a [`MigrationReceipt`].

use std::collections::HashMap;

use tch_schemas::{MigrationReceipt, Order, OrderId, OrderStage, TargetFields};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("order {0} is not in the order store")]
    NotFound(OrderId),
    #[error("order {order_id}: illegal stage transition {from} -> {to}")]
    IllegalTransition {
        order_id: OrderId,
        from: OrderStage,
        to: OrderStage,
    },
    #[error("order {order_id} is {stage}; target fields are frozen")]
    Frozen { order_id: OrderId, stage: OrderStage },
}

#[derive(Debug, Default)]
pub struct OrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an inbound intent-side order (catalog collaborators, remote list).
    ///
    /// An order already known here as formal-side is never downgraded.
    pub async fn upsert_intent(&self, order: Order) -> Result<(), StageError> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.get(&order.id) {
            if existing.stage.is_formal_side() {
                return Err(StageError::IllegalTransition {
                    order_id: order.id,
                    from: existing.stage,
                    to: order.stage,
                });
            }
        }
        if order.stage.is_formal_side() {
            return Err(StageError::IllegalTransition {
                order_id: order.id,
                from: OrderStage::Intent,
                to: order.stage,
            });
        }
        orders.insert(order.id, order);
        Ok(())
    }

    pub async fn get(&self, order_id: OrderId) -> Option<Order> {
        self.orders.read().await.get(&order_id).cloned()
    }

    /// All orders, by id.
    pub async fn list(&self) -> Vec<Order> {
        let mut out: Vec<Order> = self.orders.read().await.values().cloned().collect();
        out.sort_by_key(|o| o.id);
        out
    }

    /// Apply handler-edited target fields, and with `confirm` move Intent → Confirmed.
    pub async fn apply_lock(
        &self,
        order_id: OrderId,
        target: TargetFields,
        contact_method: Option<String>,
        confirm: bool,
    ) -> Result<Order, StageError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(StageError::NotFound(order_id))?;
        if !order.stage.target_fields_mutable() {
            return Err(StageError::Frozen {
                order_id,
                stage: order.stage,
            });
        }
        order.target = target;
        if contact_method.is_some() {
            order.contact_method = contact_method;
        }
        if confirm {
            order.stage = OrderStage::Confirmed;
            order.suggestion = None;
        }
        Ok(order.clone())
    }

    /// Confirmed → Formal, on proof that the server migration committed.
    ///
    /// Repeating with a receipt for an order that is already Formal is a no-op.
    pub async fn mark_formal(&self, receipt: &MigrationReceipt) -> Result<Order, StageError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&receipt.order_id)
            .ok_or(StageError::NotFound(receipt.order_id))?;
        match order.stage {
            OrderStage::Confirmed => {
                order.stage = OrderStage::Formal;
                order.original_order_id = Some(receipt.order_id);
                if receipt.snapshot_url.is_some() {
                    order.snapshot_ref = receipt.snapshot_url.clone();
                }
                Ok(order.clone())
            }
            OrderStage::Formal => Ok(order.clone()),
            from => Err(StageError::IllegalTransition {
                order_id: receipt.order_id,
                from,
                to: OrderStage::Formal,
            }),
        }
    }

    /// Formal → Completed | Terminated. Terminal stages accept nothing further.
    pub async fn close(&self, order_id: OrderId, to: OrderStage) -> Result<Order, StageError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(StageError::NotFound(order_id))?;
        if order.stage != OrderStage::Formal || !to.is_terminal() {
            return Err(StageError::IllegalTransition {
                order_id,
                from: order.stage,
                to,
            });
        }
        order.stage = to;
        Ok(order.clone())
    }
}
