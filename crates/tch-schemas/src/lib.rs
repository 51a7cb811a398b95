//! Wire and domain types shared by every tch crate.
//!
//! Field names follow the backend JSON (`target_gift_name`, `original_order_id`, ...)
//! so the same structs decode daemon responses and encode client requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type OrderId = i64;

/// Handler id used by intent rows nobody has claimed yet.
pub const UNASSIGNED_HANDLER_ID: i64 = 0;

/// Notification type written by the migration transaction.
pub const NOTIFICATION_FORMAL_TRANSFERRED: &str = "FORMAL_TRANSFERRED";

// ---------------------------------------------------------------------------
// OrderStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStage {
    Intent,
    Confirmed,
    Formal,
    Completed,
    Terminated,
}

impl OrderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStage::Intent => "INTENT",
            OrderStage::Confirmed => "CONFIRMED",
            OrderStage::Formal => "FORMAL",
            OrderStage::Completed => "COMPLETED",
            OrderStage::Terminated => "TERMINATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTENT" => Some(OrderStage::Intent),
            "CONFIRMED" => Some(OrderStage::Confirmed),
            "FORMAL" => Some(OrderStage::Formal),
            "COMPLETED" => Some(OrderStage::Completed),
            "TERMINATED" => Some(OrderStage::Terminated),
            _ => None,
        }
    }

    /// Target fields may only change before the order is migrated.
    pub fn target_fields_mutable(&self) -> bool {
        matches!(self, OrderStage::Intent | OrderStage::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStage::Completed | OrderStage::Terminated)
    }

    /// Stages whose record lives in the formal store.
    pub fn is_formal_side(&self) -> bool {
        matches!(
            self,
            OrderStage::Formal | OrderStage::Completed | OrderStage::Terminated
        )
    }
}

impl std::fmt::Display for OrderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// One requested line item. Supplied at creation and never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub qty: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Handler-confirmed target fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFields {
    #[serde(rename = "target_gift_name", default)]
    pub gift_name: Option<String>,
    #[serde(rename = "target_qty", default)]
    pub qty: i64,
    #[serde(default)]
    pub delivery_date: Option<String>,
}

/// Staff member operating the pipeline. Always passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub id: i64,
    pub name: String,
}

impl Handler {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub stage: OrderStage,
    pub contact_name: String,
    #[serde(default)]
    pub contact_method: Option<String>,
    #[serde(rename = "details", default)]
    pub line_items: Vec<LineItem>,
    #[serde(flatten)]
    pub target: TargetFields,
    #[serde(rename = "manager_id", default)]
    pub handler_id: i64,
    #[serde(rename = "manager_name", default)]
    pub handler_name: Option<String>,
    /// Advisory text from the completion collaborator; never authoritative.
    #[serde(rename = "ai_suggestion", default)]
    pub suggestion: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "final_image_path", default)]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub original_order_id: Option<OrderId>,
}

/// Inbound order record from the catalog collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIntentOrder {
    pub contact_name: String,
    #[serde(default)]
    pub contact_method: Option<String>,
    #[serde(rename = "details")]
    pub line_items: Vec<LineItem>,
    #[serde(rename = "manager_id", default)]
    pub handler_id: i64,
    #[serde(rename = "ai_suggestion", default)]
    pub suggestion: Option<String>,
}

// ---------------------------------------------------------------------------
// Formal side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormalOrder {
    pub id: i64,
    pub original_order_id: OrderId,
    pub status: OrderStage,
    #[serde(flatten)]
    pub target: TargetFields,
    pub contact_name: String,
    #[serde(default)]
    pub contact_method: Option<String>,
    #[serde(rename = "manager_id")]
    pub handler_id: i64,
    #[serde(rename = "manager_name")]
    pub handler_name: String,
    #[serde(rename = "final_image_path", default)]
    pub snapshot_url: Option<String>,
    #[serde(rename = "local_image_path", default)]
    pub local_snapshot_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FormalOrder {
    /// Project the formal row back into the shared `Order` shape.
    pub fn to_order(&self) -> Order {
        Order {
            id: self.original_order_id,
            stage: self.status,
            contact_name: self.contact_name.clone(),
            contact_method: self.contact_method.clone(),
            line_items: Vec::new(),
            target: self.target.clone(),
            handler_id: self.handler_id,
            handler_name: Some(self.handler_name.clone()),
            suggestion: None,
            created_at: self.created_at,
            snapshot_ref: self.snapshot_url.clone(),
            original_order_id: Some(self.original_order_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub order_id: OrderId,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

/// Response envelope used by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockIntentRequest {
    pub order_id: OrderId,
    #[serde(flatten)]
    pub target: TargetFields,
    #[serde(default)]
    pub contact_method: Option<String>,
    #[serde(rename = "intent_confirm_status")]
    pub confirm: bool,
    #[serde(rename = "manager_id")]
    pub handler_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockIntentAck {
    pub order_id: OrderId,
    pub stage: OrderStage,
}

/// Text fields carried by the multipart finalize request next to the snapshot part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeFields {
    pub order_id: OrderId,
    pub handler: Handler,
    pub target: TargetFields,
    pub contact_method: Option<String>,
    pub confirm: bool,
}

/// Snapshot part of a finalize request.
#[derive(Debug, Clone)]
pub struct SnapshotUpload {
    pub file_name: String,
    pub local_path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeAck {
    pub order_id: OrderId,
    pub formal_id: i64,
    /// `true` when the order had already been migrated by an earlier call.
    #[serde(default)]
    pub already_migrated: bool,
    #[serde(default)]
    pub snapshot_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRequest {
    pub status: OrderStage,
    #[serde(rename = "manager_id")]
    pub handler_id: i64,
}

// ---------------------------------------------------------------------------
// MigrationReceipt
// ---------------------------------------------------------------------------

/// Proof that the server migration transaction committed for an order.
///
/// The order store only moves an order to `Formal` when handed one of these,
/// so no path other than a successful finalize can set that stage.
#[allow(clippy::manual_non_exhaustive)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReceipt {
    pub order_id: OrderId,
    pub formal_id: i64,
    pub snapshot_url: Option<String>,
    _priv: (),
}

impl MigrationReceipt {
    pub fn from_finalize_ack(ack: &FinalizeAck) -> Self {
        Self {
            order_id: ack.order_id,
            formal_id: ack.formal_id,
            snapshot_url: ack.snapshot_url.clone(),
            _priv: (),
        }
    }
}
