//! Remote Order Service boundary.
//!
//! [`RemoteOrderService`] is what the conversion coordinator talks to. The
//! production implementation is [`HttpOrderService`]; tests substitute an
//! in-process one.

use serde::de::DeserializeOwned;
use tch_schemas::{
    ApiEnvelope, FinalizeAck, FinalizeFields, FormalOrder, LockIntentAck, LockIntentRequest,
    Order, SnapshotUpload,
};
use tokio::sync::oneshot;

mod http;

pub use http::HttpOrderService;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The request did not complete: connect failure, timeout, reset.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server accepted the request but failed processing it (5xx).
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// The server refused the request as invalid (4xx, or `success = false`).
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// A 2xx response whose body could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Fired once the snapshot bytes have been handed to the transport.
///
/// Lets the caller distinguish "still uploading" from "waiting on the
/// server transaction" during a single finalize call.
#[derive(Debug, Default)]
pub struct UploadSignal {
    tx: Option<oneshot::Sender<()>>,
}

impl UploadSignal {
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A signal nobody listens to.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn uploaded(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait::async_trait]
pub trait RemoteOrderService: Send + Sync {
    /// Save target fields; with `confirm` set, lock the order as CONFIRMED. Idempotent.
    async fn lock_intent_fields(&self, req: &LockIntentRequest) -> Result<LockIntentAck, RemoteError>;

    /// Upload the snapshot and run the server migration transaction.
    ///
    /// Safe to call again for an order that is already formal: the ack then
    /// carries `already_migrated = true`.
    async fn finalize(
        &self,
        fields: &FinalizeFields,
        snapshot: SnapshotUpload,
        progress: UploadSignal,
    ) -> Result<FinalizeAck, RemoteError>;

    async fn fetch_intent_list(&self, handler_id: i64) -> Result<Vec<Order>, RemoteError>;

    async fn fetch_formal_list(&self) -> Result<Vec<FormalOrder>, RemoteError>;
}

/// Decode a `{success, message, data}` body according to the HTTP status.
pub fn decode_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, RemoteError> {
    let parsed: Result<ApiEnvelope<T>, _> = serde_json::from_str(body);
    let message = |fallback: &str| match &parsed {
        Ok(env) => env.message.clone().unwrap_or_else(|| fallback.to_string()),
        Err(_) => truncate(body, 200),
    };

    // Request timeout and rate limiting say nothing about the request itself.
    if status >= 500 || status == 408 || status == 429 {
        return Err(RemoteError::Server {
            status,
            message: message("server error"),
        });
    }
    if status >= 400 {
        return Err(RemoteError::Rejected {
            status,
            message: message("request rejected"),
        });
    }

    let env = parsed.map_err(|e| RemoteError::Malformed(e.to_string()))?;
    if !env.success {
        return Err(RemoteError::Rejected {
            status,
            message: env.message.unwrap_or_else(|| "request rejected".to_string()),
        });
    }
    env.data
        .ok_or_else(|| RemoteError::Malformed("success envelope without data".to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes_map_to_error_kinds() {
        let err = decode_envelope::<FinalizeAck>(
            422,
            r#"{"success":false,"message":"order 5 is not confirmed"}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 422,
                message: "order 5 is not confirmed".to_string()
            }
        );

        let err = decode_envelope::<FinalizeAck>(503, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, RemoteError::Server { status: 503, ref message } if message.contains("bad gateway")));
    }

    #[test]
    fn timeout_and_rate_limit_stay_retryable() {
        for status in [408, 429] {
            let err = decode_envelope::<FinalizeAck>(
                status,
                r#"{"success":false,"message":"slow down"}"#,
            )
            .unwrap_err();
            assert_eq!(
                err,
                RemoteError::Server {
                    status,
                    message: "slow down".to_string()
                }
            );
        }
        let err = decode_envelope::<FinalizeAck>(404, r#"{"success":false}"#).unwrap_err();
        assert!(matches!(err, RemoteError::Rejected { status: 404, .. }));
    }

    #[test]
    fn success_envelope_yields_data() {
        let ack: FinalizeAck = decode_envelope(
            200,
            r#"{"success":true,"data":{"order_id":7,"formal_id":1,"already_migrated":true}}"#,
        )
        .unwrap();
        assert!(ack.already_migrated);
        assert_eq!(ack.order_id, 7);
    }

    #[test]
    fn missing_data_is_malformed() {
        let err = decode_envelope::<FinalizeAck>(200, r#"{"success":true}"#).unwrap_err();
        assert!(matches!(err, RemoteError::Malformed(_)));
    }

    #[test]
    fn upload_signal_fires_once() {
        let (mut signal, mut rx) = UploadSignal::channel();
        assert!(rx.try_recv().is_err());
        signal.uploaded();
        signal.uploaded();
        assert!(rx.try_recv().is_ok());
    }
}
