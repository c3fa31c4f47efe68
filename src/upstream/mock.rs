use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::{sync::Mutex, time::sleep};
use tracing::debug;

use crate::{
    errors::RelayError,
    frame::Usage,
    models::StreamRequest,
    upstream::{TransportError, Upstream, UpstreamDescriptor, UpstreamResponse},
};

/// One step of a scripted upstream body.
#[derive(Debug, Clone)]
pub enum MockChunk {
    Bytes(Vec<u8>),
    Delay(Duration),
    /// Simulates a reset connection.
    Fail(String),
    /// Never yields again.
    Stall,
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Respond {
        status: u16,
        content_type: Option<String>,
        session_id: Option<String>,
        chunks: Vec<MockChunk>,
    },
    Unreachable(String),
}

impl MockReply {
    pub fn sse<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Respond {
            status: 200,
            content_type: Some("text/event-stream".to_owned()),
            session_id: None,
            chunks: events
                .into_iter()
                .map(|event| MockChunk::Bytes(event.as_ref().as_bytes().to_vec()))
                .collect(),
        }
    }

    pub fn json(status: u16, body: &str) -> Self {
        Self::Respond {
            status,
            content_type: Some("application/json".to_owned()),
            session_id: None,
            chunks: vec![MockChunk::Bytes(body.as_bytes().to_vec())],
        }
    }

    pub fn chunks(content_type: Option<&str>, chunks: Vec<MockChunk>) -> Self {
        Self::Respond {
            status: 200,
            content_type: content_type.map(str::to_owned),
            session_id: None,
            chunks,
        }
    }

    pub fn with_session(self, id: &str) -> Self {
        match self {
            Self::Respond {
                status,
                content_type,
                chunks,
                ..
            } => Self::Respond {
                status,
                content_type,
                session_id: Some(id.to_owned()),
                chunks,
            },
            other => other,
        }
    }
}

/// What the mock saw for one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub body: Value,
    pub session_token: Option<String>,
}

/// Upstream stand-in. Scripted replies are served in order; once they run
/// out it streams an echo of the request, which is what a local run without
/// `RELAY_UPSTREAM_URL` talks to.
#[derive(Debug)]
pub struct MockUpstream {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    token_delay: Duration,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            token_delay: Duration::from_millis(35),
        }
    }
}

impl MockUpstream {
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            token_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    fn echo_reply(&self, request: &StreamRequest) -> MockReply {
        let statement = request
            .payload()
            .get("inputs")
            .and_then(|inputs| inputs.get("problemStatement"))
            .and_then(Value::as_str)
            .unwrap_or("hello");
        let content = format!(
            "Mock {} output for: {}",
            request.stage().as_str(),
            statement
        );

        let words = content.split_whitespace().collect::<Vec<_>>();
        let mut chunks = Vec::new();
        for (index, word) in words.iter().enumerate() {
            let token = if index + 1 == words.len() {
                (*word).to_owned()
            } else {
                format!("{word} ")
            };
            chunks.push(sse_chunk(&json!({ "text": token })));
            if index + 1 == words.len() / 2 {
                chunks.push(sse_chunk(&json!({
                    "progress": 50,
                    "stage": request.stage().as_str()
                })));
            }
            chunks.push(MockChunk::Delay(self.token_delay));
        }

        let input_tokens = serde_json::to_string(request.payload())
            .map(|text| text.len() as u64 / 4)
            .unwrap_or_default();
        chunks.push(sse_chunk(&json!({
            "usage": Usage::new(input_tokens, words.len() as u64),
        })));
        chunks.push(MockChunk::Bytes(b"data: [DONE]\n\n".to_vec()));

        MockReply::Respond {
            status: 200,
            content_type: Some("text/event-stream".to_owned()),
            session_id: request.session_token().map(|token| format!("mock-{token}")),
            chunks,
        }
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    fn name(&self) -> &str {
        "mock-upstream"
    }

    async fn open(
        &self,
        request: &StreamRequest,
        descriptor: &UpstreamDescriptor,
    ) -> Result<UpstreamResponse, RelayError> {
        self.calls.lock().await.push(RecordedCall {
            url: descriptor.url(),
            body: descriptor.outbound_body(request),
            session_token: request.session_token().map(str::to_owned),
        });

        let scripted = self.replies.lock().await.pop_front();
        let reply = scripted.unwrap_or_else(|| self.echo_reply(request));

        let (status, content_type, session_id, chunks) = match reply {
            MockReply::Unreachable(message) => {
                return Err(RelayError::UpstreamUnavailable(message));
            }
            MockReply::Respond {
                status,
                content_type,
                session_id,
                chunks,
            } => (status, content_type, session_id, chunks),
        };

        let body = async_stream::stream! {
            for chunk in chunks {
                match chunk {
                    MockChunk::Bytes(bytes) => yield Ok(Bytes::from(bytes)),
                    MockChunk::Delay(delay) => {
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                    }
                    MockChunk::Fail(message) => {
                        yield Err(TransportError(message));
                        break;
                    }
                    MockChunk::Stall => std::future::pending::<()>().await,
                }
            }
        };

        debug!(upstream = self.name(), request_id = %request.request_id(), status, "mock reply prepared");
        Ok(UpstreamResponse {
            status,
            content_type,
            session_id,
            body: body.boxed(),
        })
    }
}

fn sse_chunk(value: &Value) -> MockChunk {
    MockChunk::Bytes(format!("data: {value}\n\n").into_bytes())
}
