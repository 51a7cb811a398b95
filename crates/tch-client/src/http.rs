use std::task::Poll;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Response};
use serde::de::DeserializeOwned;
use tch_config::RemoteSection;
use tch_schemas::{
    FinalizeAck, FinalizeFields, FormalOrder, LockIntentAck, LockIntentRequest, Order,
    SnapshotUpload,
};
use tracing::{debug, warn};

use crate::{decode_envelope, RemoteError, RemoteOrderService, UploadSignal};

const UPLOAD_CHUNK: usize = 64 * 1024;

/// reqwest-backed client for the order daemon's `/v1` API.
#[derive(Debug, Clone)]
pub struct HttpOrderService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpOrderService {
    pub fn new(remote: &RemoteSection) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .connect_timeout(remote.connect_timeout())
            .timeout(remote.request_timeout())
            .build()
            .map_err(|e| RemoteError::Transport(format!("client build failed: {e}")))?;
        Ok(Self::with_client(http, remote.base_url.clone()))
    }

    pub fn with_client(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport)?;
        decode_envelope(status, &body)
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

/// Snapshot bytes as a streamed body whose end fires `progress`.
fn snapshot_body(bytes: Vec<u8>, mut progress: UploadSignal) -> Body {
    let bytes = Bytes::from(bytes);
    let chunks: Vec<Result<Bytes, std::io::Error>> = (0..bytes.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| Ok(bytes.slice(start..(start + UPLOAD_CHUNK).min(bytes.len()))))
        .collect();
    let tail = stream::poll_fn(move |_cx| -> Poll<Option<Result<Bytes, std::io::Error>>> {
        progress.uploaded();
        Poll::Ready(None)
    });
    Body::wrap_stream(stream::iter(chunks).chain(tail))
}

#[async_trait::async_trait]
impl RemoteOrderService for HttpOrderService {
    async fn lock_intent_fields(&self, req: &LockIntentRequest) -> Result<LockIntentAck, RemoteError> {
        let url = self.url(&format!("/v1/intent-orders/{}/lock", req.order_id));
        debug!(order_id = req.order_id, confirm = req.confirm, "POST lock intent fields");
        let resp = self
            .http
            .post(url)
            .json(req)
            .send()
            .await
            .map_err(transport)?;
        Self::read(resp).await
    }

    async fn finalize(
        &self,
        fields: &FinalizeFields,
        snapshot: SnapshotUpload,
        progress: UploadSignal,
    ) -> Result<FinalizeAck, RemoteError> {
        let len = snapshot.bytes.len() as u64;
        let part = Part::stream_with_length(snapshot_body(snapshot.bytes, progress), len)
            .file_name(snapshot.file_name.clone())
            .mime_str("image/png")
            .map_err(transport)?;

        let mut form = Form::new()
            .text("order_id", fields.order_id.to_string())
            .text("manager_id", fields.handler.id.to_string())
            .text("manager_name", fields.handler.name.clone())
            .text("target_qty", fields.target.qty.to_string())
            .text(
                "intent_confirm_status",
                if fields.confirm { "1" } else { "0" },
            )
            .text("local_image_path", snapshot.local_path.clone());
        if let Some(gift) = &fields.target.gift_name {
            form = form.text("target_gift_name", gift.clone());
        }
        if let Some(date) = &fields.target.delivery_date {
            form = form.text("delivery_date", date.clone());
        }
        if let Some(contact) = &fields.contact_method {
            form = form.text("contact_method", contact.clone());
        }
        // The snapshot goes last so its end marks the end of the upload.
        let form = form.part("image", part);

        debug!(order_id = fields.order_id, bytes = len, "POST finalize");
        let resp = self
            .http
            .post(self.url("/v1/orders/finalize"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(order_id = fields.order_id, error = %e, "finalize transport failure");
                transport(e)
            })?;
        Self::read(resp).await
    }

    async fn fetch_intent_list(&self, handler_id: i64) -> Result<Vec<Order>, RemoteError> {
        let resp = self
            .http
            .get(self.url("/v1/intent-orders"))
            .query(&[("handler_id", handler_id)])
            .send()
            .await
            .map_err(transport)?;
        Self::read(resp).await
    }

    async fn fetch_formal_list(&self) -> Result<Vec<FormalOrder>, RemoteError> {
        let resp = self
            .http
            .get(self.url("/v1/formal-orders"))
            .send()
            .await
            .map_err(transport)?;
        Self::read(resp).await
    }
}
