use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::{
    config::UpstreamConfig,
    errors::RelayError,
    models::StreamRequest,
    upstream::{SessionConvention, TransportError, Upstream, UpstreamDescriptor, UpstreamResponse},
};

#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| format!("failed to build upstream HTTP client: {error}"))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        "http-upstream"
    }

    async fn open(
        &self,
        request: &StreamRequest,
        descriptor: &UpstreamDescriptor,
    ) -> Result<UpstreamResponse, RelayError> {
        let mut builder = self
            .client
            .post(descriptor.url())
            .timeout(descriptor.timeout)
            .json(&descriptor.outbound_body(request));

        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (name, value) in &descriptor.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = request.session_token() {
            match &descriptor.session {
                SessionConvention::Header(name) => {
                    builder = builder.header(name.as_str(), token);
                }
                SessionConvention::Query(name) => {
                    builder = builder.query(&[(name.as_str(), token)]);
                }
                SessionConvention::BodyField(_) | SessionConvention::None => {}
            }
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                RelayError::UpstreamUnavailable(format!("timed out waiting for upstream: {error}"))
            } else {
                RelayError::UpstreamUnavailable(error.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let session_id = descriptor
            .session_response_header
            .as_deref()
            .and_then(|name| response.headers().get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        debug!(
            upstream = self.name(),
            request_id = %request.request_id(),
            status,
            content_type = content_type.as_deref().unwrap_or("none"),
            "upstream response head received"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|error| TransportError(error.to_string())))
            .boxed();

        Ok(UpstreamResponse {
            status,
            content_type,
            session_id,
            body,
        })
    }
}
