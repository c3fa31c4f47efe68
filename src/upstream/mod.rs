pub mod http;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::{errors::RelayError, models::StreamRequest};

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A read failure after the upstream response head arrived.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Where an upstream expects the conversation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionConvention {
    None,
    Header(String),
    BodyField(String),
    Query(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamDescriptor {
    pub base_url: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub session: SessionConvention,
    /// Response header the upstream uses to hand back its own session id.
    pub session_response_header: Option<String>,
}

impl UpstreamDescriptor {
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    /// JSON body sent upstream: the validated payload, plus the session token
    /// when the upstream takes it in the body.
    pub fn outbound_body(&self, request: &StreamRequest) -> Value {
        let mut body = request.payload().clone();
        if let (SessionConvention::BodyField(field), Some(token)) =
            (&self.session, request.session_token())
        {
            body.insert(field.clone(), Value::String(token.to_owned()));
        }
        Value::Object(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    EventStream,
    Chunked,
    Buffered,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub session_id: Option<String>,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_kind(&self) -> BodyKind {
        let Some(content_type) = self.content_type.as_deref() else {
            return BodyKind::Chunked;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence == "text/event-stream" {
            BodyKind::EventStream
        } else if essence == "application/json" || essence.ends_with("+json") {
            BodyKind::Buffered
        } else {
            BodyKind::Chunked
        }
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// The model-hosting service behind the relay. Constructed once at start-up
/// and shared through `AppState`.
#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;

    /// Issues the call and returns as soon as the response head is known.
    /// Only failures to obtain a response at all are errors here; status
    /// handling belongs to the relay.
    async fn open(
        &self,
        request: &StreamRequest,
        descriptor: &UpstreamDescriptor,
    ) -> Result<UpstreamResponse, RelayError>;
}
