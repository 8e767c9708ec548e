//! Provider adapters.
//!
//! A [`ProviderAdapter`] turns a [`CanonicalRequest`] into one upstream call
//! and maps the answer (or failure) back into canonical form. The wire format
//! is picked from the deployment's [`ProviderKind`]; adapters never retry.

pub mod anthropic;
pub mod canonical;
pub mod error;
pub mod openai;
pub mod sse;

pub use canonical::{
    CanonicalChoice, CanonicalChunk, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    GenerationParams, RequestKind, Role, Usage,
};
pub use error::{AdapterError, AdapterErrorKind};

use crate::core::config::Credential;
use crate::services::routing_table::Deployment;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sse::{SseEvent, SseParser};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

/// Canonical chunks produced by a streaming upstream call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CanonicalChunk, AdapterError>> + Send>>;

/// Provider family, which determines the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai", alias = "openai_compatible")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    pub fn wire_format(&self) -> &'static dyn WireFormat {
        match self {
            Self::OpenAi => &openai::OpenAiWire,
            Self::Anthropic => &anthropic::AnthropicWire,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of decoding one upstream SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    /// Zero or more canonical chunks (keep-alives decode to none)
    Chunks(Vec<CanonicalChunk>),
    /// Upstream signalled the end of the stream
    Done,
}

/// Stateful decoder for one upstream stream.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<StreamStep, AdapterError>;
}

/// Translation between canonical types and one provider's HTTP API.
pub trait WireFormat: Send + Sync {
    /// Path appended to the deployment's `api_base`.
    fn endpoint(&self, kind: RequestKind) -> &'static str;

    /// Attach authentication and protocol headers.
    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credential: &Credential,
    ) -> reqwest::RequestBuilder;

    /// Build the upstream JSON body.
    fn request_body(&self, model: &str, request: &CanonicalRequest, stream: bool) -> Value;

    /// Decode a successful non-streaming body.
    fn parse_response(
        &self,
        kind: RequestKind,
        body: Value,
    ) -> Result<CanonicalResponse, AdapterError>;

    fn stream_decoder(&self, kind: RequestKind) -> Box<dyn StreamDecoder>;
}

/// Capability interface over every provider variant.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn invoke(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
    ) -> Result<CanonicalResponse, AdapterError>;

    /// Open a streaming call. The returned stream ends after the upstream
    /// end-of-stream marker or after yielding one error.
    async fn invoke_stream(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, AdapterError>;
}

/// HTTP implementation over a shared, pooled client.
#[derive(Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
        stream: bool,
    ) -> Result<reqwest::Response, AdapterError> {
        let wire = deployment.provider.wire_format();
        let url = format!(
            "{}{}",
            deployment.api_base.trim_end_matches('/'),
            wire.endpoint(request.kind)
        );
        let body = wire.request_body(&deployment.model, request, stream);

        tracing::debug!(
            deployment = %deployment.id,
            provider = %deployment.provider,
            stream,
            "Sending upstream request"
        );

        let builder = wire.authorize(self.client.post(&url), &deployment.credential);
        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(&e, &deployment.credential))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await.unwrap_or_default();
        Err(AdapterError::from_status(
            status.as_u16(),
            retry_after.as_deref(),
            &text,
            &deployment.credential,
        ))
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    async fn invoke(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
    ) -> Result<CanonicalResponse, AdapterError> {
        let response = self.send(deployment, request, false).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::from_transport(&e, &deployment.credential))?;
        deployment
            .provider
            .wire_format()
            .parse_response(request.kind, body)
            .map_err(|e| redact_error(e, &deployment.credential))
    }

    async fn invoke_stream(
        &self,
        deployment: &Deployment,
        request: &CanonicalRequest,
    ) -> Result<ChunkStream, AdapterError> {
        let response = self.send(deployment, request, true).await?;
        let credential = deployment.credential.clone();
        let mut decoder = deployment.provider.wire_format().stream_decoder(request.kind);

        let stream = async_stream::stream! {
            let mut upstream = response.bytes_stream();
            let mut parser = SseParser::new();

            while let Some(item) = upstream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(AdapterError::from_transport(&e, &credential));
                        return;
                    }
                };

                for event in parser.parse(&bytes) {
                    match decoder.decode(&event) {
                        Ok(StreamStep::Chunks(chunks)) => {
                            for chunk in chunks {
                                yield Ok(chunk);
                            }
                        }
                        Ok(StreamStep::Done) => return,
                        Err(e) => {
                            yield Err(redact_error(e, &credential));
                            return;
                        }
                    }
                }
            }

            if let Some(event) = parser.finish() {
                match decoder.decode(&event) {
                    Ok(StreamStep::Chunks(chunks)) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Ok(StreamStep::Done) => {}
                    Err(e) => yield Err(redact_error(e, &credential)),
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn redact_error(mut error: AdapterError, credential: &Credential) -> AdapterError {
    error.message = credential.redact(&error.message);
    error
}

/// Create the shared upstream HTTP client with connection pooling.
///
/// No overall timeout is set on the client; attempts are bounded by the
/// fallback engine so long-lived streams are not cut off.
pub fn create_http_client(verify_ssl: bool) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(!verify_ssl)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_serde() {
        let kind: ProviderKind = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAi);
        let kind: ProviderKind = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAi);
        let kind: ProviderKind = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(kind, ProviderKind::Anthropic);
        assert!(serde_json::from_str::<ProviderKind>("\"gemini\"").is_err());
    }

    #[test]
    fn test_provider_kind_endpoints() {
        assert_eq!(
            ProviderKind::OpenAi.wire_format().endpoint(RequestKind::Chat),
            "/chat/completions"
        );
        assert_eq!(
            ProviderKind::OpenAi.wire_format().endpoint(RequestKind::Text),
            "/completions"
        );
        assert_eq!(
            ProviderKind::Anthropic.wire_format().endpoint(RequestKind::Chat),
            "/v1/messages"
        );
    }

    #[test]
    fn test_create_http_client() {
        assert!(create_http_client(true).is_ok());
        assert!(create_http_client(false).is_ok());
    }
}
