//! Axum router and HTTP handlers for tch-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers, so tests can drive the bare router.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tch_db::SnapshotLocation;
use tch_schemas::{
    ApiEnvelope, FinalizeAck, FormalOrder, LockIntentAck, LockIntentRequest, NewIntentOrder,
    Order, OrderId, OrderStage, TerminalRequest,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::services::ServeDir;
use tracing::info;

use crate::{
    api_types::{ApiError, FinalizeForm, HealthResponse, IntentListQuery},
    state::{AppState, BusMsg, OrderEvent},
};

/// Upper bound on a finalize request; certificates are a few hundred KiB.
pub const FINALIZE_BODY_LIMIT: usize = 16 * 1024 * 1024;

type ApiResult<T> = Result<Json<ApiEnvelope<T>>, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let files = ServeDir::new(state.uploads.dir());
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/intent-orders", get(list_intents).post(create_intent))
        .route("/v1/intent-orders/:id/lock", post(lock_intent))
        .route(
            "/v1/orders/finalize",
            post(finalize).layer(DefaultBodyLimit::max(FINALIZE_BODY_LIMIT)),
        )
        .route("/v1/formal-orders", get(list_formal))
        .route("/v1/formal-orders/:id/close", post(close_formal))
        .nest_service("/files", files)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Intent orders
// ---------------------------------------------------------------------------

/// Inbound intent from the catalog side.
pub(crate) async fn create_intent(
    State(st): State<Arc<AppState>>,
    Json(req): Json<NewIntentOrder>,
) -> ApiResult<Order> {
    let order = tch_db::insert_intent(&st.pool, &req).await?;
    st.publish(order.id, OrderEvent::IntentCreated);
    Ok(Json(ApiEnvelope::ok(order)))
}

pub(crate) async fn list_intents(
    State(st): State<Arc<AppState>>,
    Query(q): Query<IntentListQuery>,
) -> ApiResult<Vec<Order>> {
    let orders = tch_db::list_intents_for_handler(&st.pool, q.handler_id).await?;
    Ok(Json(ApiEnvelope::ok(orders)))
}

pub(crate) async fn lock_intent(
    State(st): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(req): Json<LockIntentRequest>,
) -> ApiResult<LockIntentAck> {
    if req.order_id != id {
        return Err(ApiError::bad_request(format!(
            "path order {id} does not match body order {}",
            req.order_id
        )));
    }
    let ack = tch_db::lock_intent_fields(&st.pool, &req).await?;
    let event = if ack.stage == OrderStage::Confirmed {
        OrderEvent::IntentConfirmed
    } else {
        OrderEvent::IntentSaved
    };
    st.publish(id, event);

    let message = if req.confirm {
        "intent locked"
    } else {
        "draft saved"
    };
    Ok(Json(ApiEnvelope::ok_with_message(ack, message)))
}

// ---------------------------------------------------------------------------
// POST /v1/orders/finalize
// ---------------------------------------------------------------------------

/// Store the uploaded certificate and run the migration transaction.
///
/// A repeated call for an order that is already formal stores nothing and
/// answers with the existing record (`already_migrated = true`).
pub(crate) async fn finalize(
    State(st): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<FinalizeAck> {
    let mut form = FinalizeForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read image part: {e}")))?;
            form.image = Some(bytes.to_vec());
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read field {name}: {e}")))?;
            form.set_text(&name, text);
        }
    }
    let (fields, image, local_path) = form.into_parts()?;
    let order_id = fields.order_id;

    if let Some(existing) = tch_db::fetch_formal_by_original(&st.pool, order_id).await? {
        info!(order_id, formal_id = existing.id, "finalize: already migrated");
        return Ok(Json(ApiEnvelope::ok_with_message(
            FinalizeAck {
                order_id,
                formal_id: existing.id,
                already_migrated: true,
                snapshot_url: existing.snapshot_url,
            },
            "order already migrated",
        )));
    }

    let stored = st.uploads.save(order_id, &image).await?;
    let location = SnapshotLocation {
        url: Some(stored.url.clone()),
        local_path,
    };

    match tch_db::finalize_order(&st.pool, &fields, &location).await {
        Ok(ack) => {
            if ack.already_migrated {
                // Lost the race to a concurrent finalize. Its row references
                // its own upload; only this request's file goes.
                if ack.snapshot_url.as_deref() != Some(stored.url.as_str()) {
                    st.uploads.discard(&stored).await;
                }
            } else {
                st.publish(order_id, OrderEvent::FormalTransferred);
            }
            let message = if ack.already_migrated {
                "order already migrated"
            } else {
                "order transferred to formal"
            };
            Ok(Json(ApiEnvelope::ok_with_message(ack, message)))
        }
        Err(e) => {
            st.uploads.discard(&stored).await;
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Formal orders
// ---------------------------------------------------------------------------

pub(crate) async fn list_formal(State(st): State<Arc<AppState>>) -> ApiResult<Vec<FormalOrder>> {
    let orders = tch_db::list_formal_orders(&st.pool).await?;
    Ok(Json(ApiEnvelope::ok(orders)))
}

pub(crate) async fn close_formal(
    State(st): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(req): Json<TerminalRequest>,
) -> ApiResult<FormalOrder> {
    let closed = tch_db::close_formal_order(&st.pool, id, req.status, req.handler_id).await?;
    st.publish(id, OrderEvent::FormalClosed);
    Ok(Json(ApiEnvelope::ok(closed)))
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Order { .. } => "order",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
