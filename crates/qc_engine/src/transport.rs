//! The relay seam.
//!
//! The engine talks to the relay only through [`RelayTransport`], so tests
//! run against an in-memory fake and the shell can swap transports. The HTTP
//! implementation maps the JSON endpoints one-to-one.
//!
//! Error classification is part of the contract: status 0 (network) and 5xx
//! are transient and eligible for the outbox retry policy; everything else is
//! permanent. 423 (LOCKED) is special-cased as transient — the relay uses it
//! while a conversation is briefly write-locked.

use async_trait::async_trait;
use thiserror::Error;

use qc_proto::api::{
    AtomicSendRequest, CounterTooLowBody, MessagePage, SendAccepted, SendMessageRequest,
    WsTokenGrant, WsTokenRequest,
};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transient transport failure (status {status})")]
    Transient { status: u16 },

    #[error("permanent transport failure (status {status}): {body}")]
    Permanent { status: u16, body: String },

    #[error("transport operation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    pub fn status(&self) -> u16 {
        match self {
            TransportError::Transient { status } | TransportError::Permanent { status, .. } => {
                *status
            }
            TransportError::Cancelled => 0,
        }
    }

    pub fn classify(status: u16, body: String) -> Self {
        if status == 0 || status >= 500 || status == 423 {
            TransportError::Transient { status }
        } else {
            TransportError::Permanent { status, body }
        }
    }
}

/// Result of a send attempt that reached the relay.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Accepted { id: String },
    /// 409: the relay has already accepted `max_counter` (inclusive) from
    /// this device. The message must not be re-sent with the same counter.
    CounterTooLow { max_counter: u64 },
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn ws_token(&self, req: &WsTokenRequest) -> Result<WsTokenGrant, TransportError>;

    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendOutcome, TransportError>;

    async fn send_atomic(&self, req: &AtomicSendRequest) -> Result<SendOutcome, TransportError>;

    /// Pull a page of stored messages, ordered `(ts asc, id asc)`.
    async fn pull_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        cursor_ts: Option<i64>,
    ) -> Result<MessagePage, TransportError>;

    /// Monotone cursor push; the server rejects regressions.
    async fn push_deletion_cursor(
        &self,
        conversation_id: &str,
        cursor: u64,
    ) -> Result<(), TransportError>;

    /// Remote contact backup, if the account has one. Sealed payload opaque
    /// to the relay.
    async fn fetch_contact_backup(
        &self,
        account_digest: &str,
    ) -> Result<Option<String>, TransportError>;

    /// Hand a sealed media manifest to the upload collaborator. Chunking and
    /// the media store live outside the core; the outbox only schedules the
    /// job. Returns the collaborator's reference id.
    async fn upload_media(&self, manifest_ref: &str) -> Result<String, TransportError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

pub struct HttpRelay {
    base_url: String,
    client: reqwest::Client,
    bearer_token: tokio::sync::RwLock<Option<String>>,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            bearer_token: tokio::sync::RwLock::new(None),
        }
    }

    pub async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write().await = token;
    }

    async fn post_json<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TransportError> {
        let mut req = self.client.post(format!("{}{path}", self.base_url)).json(body);
        if let Some(token) = self.bearer_token.read().await.as_deref() {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Cancelled
                } else {
                    TransportError::Transient { status: 0 }
                }
            })
    }

    async fn get_json(&self, path: &str) -> Result<reqwest::Response, TransportError> {
        let mut req = self.client.get(format!("{}{path}", self.base_url));
        if let Some(token) = self.bearer_token.read().await.as_deref() {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|_| TransportError::Transient { status: 0 })
    }

    async fn read_send_outcome(
        resp: reqwest::Response,
    ) -> Result<SendOutcome, TransportError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            let accepted: SendAccepted = resp
                .json()
                .await
                .map_err(|e| TransportError::Permanent { status, body: e.to_string() })?;
            return Ok(SendOutcome::Accepted { id: accepted.id });
        }
        let body = resp.text().await.unwrap_or_default();
        if status == 409 {
            if let Ok(too_low) = serde_json::from_str::<CounterTooLowBody>(&body) {
                if too_low.error == "CounterTooLow" {
                    return Ok(SendOutcome::CounterTooLow { max_counter: too_low.max_counter });
                }
            }
        }
        Err(TransportError::classify(status, body))
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn ws_token(&self, req: &WsTokenRequest) -> Result<WsTokenGrant, TransportError> {
        let resp = self.post_json("/api/v1/ws/token", req).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::classify(status, body));
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Permanent { status, body: e.to_string() })
    }

    async fn send_message(&self, req: &SendMessageRequest) -> Result<SendOutcome, TransportError> {
        let resp = self.post_json("/api/v1/messages", req).await?;
        Self::read_send_outcome(resp).await
    }

    async fn send_atomic(&self, req: &AtomicSendRequest) -> Result<SendOutcome, TransportError> {
        let resp = self.post_json("/api/v1/messages/atomic", req).await?;
        Self::read_send_outcome(resp).await
    }

    async fn pull_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        cursor_ts: Option<i64>,
    ) -> Result<MessagePage, TransportError> {
        let mut path = format!("/api/v1/messages?convId={conversation_id}&limit={limit}");
        if let Some(ts) = cursor_ts {
            path.push_str(&format!("&cursorTs={ts}"));
        }
        let resp = self.get_json(&path).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::classify(status, body));
        }
        resp.json()
            .await
            .map_err(|e| TransportError::Permanent { status, body: e.to_string() })
    }

    async fn push_deletion_cursor(
        &self,
        conversation_id: &str,
        cursor: u64,
    ) -> Result<(), TransportError> {
        let resp = self
            .post_json(
                &format!("/api/v1/conversations/{conversation_id}/deletion-cursor"),
                &qc_proto::api::DeletionCursorUpdate { cursor },
            )
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::classify(status, body));
        }
        Ok(())
    }

    async fn fetch_contact_backup(
        &self,
        account_digest: &str,
    ) -> Result<Option<String>, TransportError> {
        let resp = self
            .get_json(&format!("/api/v1/backup/contacts?digest={account_digest}"))
            .await?;
        let status = resp.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::classify(status, body));
        }
        let payload = resp
            .text()
            .await
            .map_err(|e| TransportError::Permanent { status, body: e.to_string() })?;
        Ok(if payload.is_empty() { None } else { Some(payload) })
    }

    async fn upload_media(&self, manifest_ref: &str) -> Result<String, TransportError> {
        let resp = self
            .post_json("/api/v1/media/manifest", &serde_json::json!({ "manifest_ref": manifest_ref }))
            .await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::classify(status, body));
        }
        resp.text()
            .await
            .map_err(|e| TransportError::Permanent { status, body: e.to_string() })
    }
}
