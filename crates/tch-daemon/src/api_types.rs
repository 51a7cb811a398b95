//! Request and response types for tch-daemon HTTP endpoints.
//!
//! Every JSON body is wrapped in [`ApiEnvelope`]. Failures carry
//! `success = false` and a message; the HTTP status says whether retrying
//! can help (5xx) or the request itself is wrong (4xx).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tch_db::StoreError;
use tch_schemas::{ApiEnvelope, FinalizeFields, Handler, OrderId, TargetFields};
use tracing::error;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/intent-orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IntentListQuery {
    pub handler_id: i64,
}

// ---------------------------------------------------------------------------
// /v1/orders/finalize (multipart)
// ---------------------------------------------------------------------------

/// Raw multipart fields of a finalize request, before validation.
#[derive(Debug, Default)]
pub struct FinalizeForm {
    pub order_id: Option<String>,
    pub manager_id: Option<String>,
    pub manager_name: Option<String>,
    pub target_gift_name: Option<String>,
    pub target_qty: Option<String>,
    pub delivery_date: Option<String>,
    pub contact_method: Option<String>,
    pub intent_confirm_status: Option<String>,
    pub local_image_path: Option<String>,
    pub image: Option<Vec<u8>>,
}

impl FinalizeForm {
    /// Record one text field. Unknown names are ignored.
    pub fn set_text(&mut self, name: &str, value: String) {
        let slot = match name {
            "order_id" => &mut self.order_id,
            "manager_id" => &mut self.manager_id,
            "manager_name" => &mut self.manager_name,
            "target_gift_name" => &mut self.target_gift_name,
            "target_qty" => &mut self.target_qty,
            "delivery_date" => &mut self.delivery_date,
            "contact_method" => &mut self.contact_method,
            "intent_confirm_status" => &mut self.intent_confirm_status,
            "local_image_path" => &mut self.local_image_path,
            _ => return,
        };
        *slot = Some(value);
    }

    /// Validate into store fields plus the snapshot bytes.
    pub fn into_parts(self) -> Result<(FinalizeFields, Vec<u8>, Option<String>), ApiError> {
        let order_id: OrderId = parse_required(self.order_id.as_deref(), "order_id")?;
        let handler_id: i64 = parse_required(self.manager_id.as_deref(), "manager_id")?;
        let handler_name = non_empty(self.manager_name)
            .ok_or_else(|| ApiError::bad_request("manager_name is required"))?;
        let qty: i64 = match non_empty(self.target_qty) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("target_qty is not a number: {raw}")))?,
            None => 0,
        };
        let confirm = matches!(
            self.intent_confirm_status.as_deref().map(str::trim),
            Some("1") | Some("true")
        );
        let image = self
            .image
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ApiError::unprocessable("snapshot part 'image' is missing or empty"))?;

        let fields = FinalizeFields {
            order_id,
            handler: Handler::new(handler_id, handler_name),
            target: TargetFields {
                gift_name: non_empty(self.target_gift_name),
                qty,
                delivery_date: non_empty(self.delivery_date),
            },
            contact_method: non_empty(self.contact_method),
            confirm,
        };
        Ok((fields, image, non_empty(self.local_image_path)))
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_required<T: std::str::FromStr>(raw: Option<&str>, name: &str) -> Result<T, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))?;
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("{name} is not a number: {raw}")))
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyClosed { .. } => StatusCode::CONFLICT,
            StoreError::NotConfirmed(_) | StoreError::Frozen(_) | StoreError::Invalid(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            StoreError::Database(_) | StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(ApiEnvelope::<()>::fail(self.message))).into_response()
    }
}
