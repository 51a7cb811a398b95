//! Per-attempt conversion state machine, progress events and the failure taxonomy.
//!
//! ```text
//! Idle ─► Rendering ─► Uploading ─► ServerFinalizing ─► Done
//!   │                     ▲
//!   └──── (resume) ───────┘
//! any non-terminal state ─► Failed(reason)
//! ```

use std::time::Duration;

use serde::Serialize;
use tch_client::RemoteError;
use tch_render::RenderError;
use tch_schemas::{OrderId, OrderStage};
use uuid::Uuid;

use crate::order_store::StageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConversionState {
    Idle,
    Rendering,
    Uploading,
    ServerFinalizing,
    Done,
    Failed { reason: String, retryable: bool },
}

impl ConversionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &ConversionState) -> bool {
        use ConversionState::*;
        match (self, next) {
            (s, Failed { .. }) => !s.is_terminal(),
            (Idle, Rendering) | (Idle, Uploading) => true,
            (Rendering, Uploading) => true,
            (Uploading, ServerFinalizing) => true,
            (ServerFinalizing, Done) => true,
            _ => false,
        }
    }
}

/// Progress notification for one conversion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionEvent {
    pub order_id: OrderId,
    pub attempt_id: Uuid,
    #[serde(flatten)]
    pub state: ConversionState,
    pub ts_millis: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("order {order_id} is {stage}; only CONFIRMED orders can be converted")]
    NotConfirmed { order_id: OrderId, stage: OrderStage },
    #[error("a conversion for order {0} is already in flight")]
    AlreadyInFlight(OrderId),
    #[error("render timed out after {0:?} waiting for the completion signal")]
    RenderTimeout(Duration),
    #[error("rendered certificate is empty")]
    RenderEmptyContent,
    #[error("render failed: {0}")]
    RenderFailed(String),
    #[error("snapshot write failed: {0}")]
    SnapshotWriteFailure(String),
    #[error("retry queue failure: {0}")]
    QueueFailure(String),
    #[error("snapshot for order {order_id} is unreadable at {path}: {reason}")]
    SnapshotUnreadable {
        order_id: OrderId,
        path: String,
        reason: String,
    },
    #[error("upload failed: {0}")]
    UploadNetworkFailure(String),
    #[error("server transaction failed: {0}")]
    ServerTransactionFailure(String),
    #[error("server rejected the order: {0}")]
    ServerValidationFailure(String),
    #[error(transparent)]
    Stage(#[from] StageError),
}

impl ConversionError {
    /// Failures after the durable checkpoint whose intent record is intact.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UploadNetworkFailure(_) | Self::ServerTransactionFailure(_)
        )
    }
}

impl From<RenderError> for ConversionError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::RenderTimeout(d) => Self::RenderTimeout(d),
            RenderError::RenderEmptyContent { .. } => Self::RenderEmptyContent,
            RenderError::NotRenderable { order_id, stage } => Self::NotConfirmed { order_id, stage },
            RenderError::SnapshotWrite { .. } => Self::SnapshotWriteFailure(e.to_string()),
            RenderError::EngineUnavailable | RenderError::Encode(_) => {
                Self::RenderFailed(e.to_string())
            }
        }
    }
}

impl From<RemoteError> for ConversionError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transport(msg) => Self::UploadNetworkFailure(msg),
            RemoteError::Server { .. } | RemoteError::Malformed(_) => {
                Self::ServerTransactionFailure(e.to_string())
            }
            RemoteError::Rejected { message, .. } => Self::ServerValidationFailure(message),
        }
    }
}
