//! Server-Sent Events (SSE) streaming support for routed completions.
//!
//! Canonical chunks from the fallback engine are rendered as OpenAI
//! `chat.completion.chunk` (or `text_completion`) events with the model
//! rewritten to the requested alias. A mid-stream upstream failure becomes a
//! single error event and ends the stream; text already sent stays sent.

use crate::adapter::sse::format_sse_data;
use crate::adapter::{AdapterError, CanonicalChunk, ChunkStream, RequestKind};
use crate::api::models::render_chunk;
use crate::core::error_types::ERROR_TYPE_STREAM;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::StreamExt;
use serde_json::json;
use bytes::Bytes;
use std::convert::Infallible;

/// Sentinel closing a successful stream.
pub const DONE_EVENT: &str = "[DONE]";

/// Build the `text/event-stream` response for an open upstream stream.
///
/// The body owns `chunks`, so a client that stops reading drops the upstream
/// stream along with it.
pub fn create_sse_response(kind: RequestKind, alias: String, chunks: ChunkStream) -> Response {
    let body = sse_events(kind, alias, chunks);

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

fn sse_events(
    kind: RequestKind,
    alias: String,
    mut chunks: ChunkStream,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send {
    async_stream::stream! {
        let created = chrono::Utc::now().timestamp();
        let mut id = default_stream_id(kind);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(upstream_id) = &chunk.id {
                        id = upstream_id.clone();
                    }
                    if is_empty(&chunk) {
                        continue;
                    }
                    let event = render_chunk(kind, &id, created, &alias, &chunk);
                    yield Ok(Bytes::from(format_sse_data(&event.to_string())));
                }
                Err(err) => {
                    yield Ok(Bytes::from(format_sse_data(&error_event(&err).to_string())));
                    return;
                }
            }
        }

        yield Ok(Bytes::from(format_sse_data(DONE_EVENT)));
    }
}

fn default_stream_id(kind: RequestKind) -> String {
    let prefix = match kind {
        RequestKind::Chat => "chatcmpl",
        RequestKind::Text => "cmpl",
    };
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Chunks that carry nothing the client can see (e.g. a bare `message_start`).
fn is_empty(chunk: &CanonicalChunk) -> bool {
    chunk.role.is_none()
        && chunk.content.is_none()
        && chunk.finish_reason.is_none()
        && chunk.usage.is_none()
}

fn error_event(err: &AdapterError) -> serde_json::Value {
    json!({
        "error": {
            "message": err.message,
            "type": ERROR_TYPE_STREAM,
            "code": err.kind.as_str(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterErrorKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    async fn collect_body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn events(body: &str) -> Vec<&str> {
        body.split("\n\n")
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_start_matches("data: "))
            .collect()
    }

    #[tokio::test]
    async fn test_stream_renders_chunks_and_done() {
        let chunks: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(CanonicalChunk {
                id: Some("chatcmpl-up".to_string()),
                ..CanonicalChunk::default()
            }),
            Ok(CanonicalChunk::text("Hel")),
            Ok(CanonicalChunk::text("lo")),
        ]));

        let response = create_sse_response(RequestKind::Chat, "gpt-4".to_string(), chunks);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = collect_body(response).await;
        let events = events(&body);
        assert_eq!(events.len(), 3);

        let first: serde_json::Value = serde_json::from_str(events[0]).unwrap();
        assert_eq!(first["id"], "chatcmpl-up");
        assert_eq!(first["model"], "gpt-4");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(events[2], "[DONE]");
    }

    #[tokio::test]
    async fn test_mid_stream_error_emits_single_error_event() {
        let chunks: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(CanonicalChunk::text("partial")),
            Err(AdapterError::new(AdapterErrorKind::ServerError, "upstream reset")),
            Ok(CanonicalChunk::text("never sent")),
        ]));

        let response = create_sse_response(RequestKind::Text, "gpt-4".to_string(), chunks);
        let body = collect_body(response).await;
        let events = events(&body);

        assert_eq!(events.len(), 2);
        let first: serde_json::Value = serde_json::from_str(events[0]).unwrap();
        assert_eq!(first["choices"][0]["text"], "partial");

        let error: serde_json::Value = serde_json::from_str(events[1]).unwrap();
        assert_eq!(error["error"]["type"], "stream_error");
        assert_eq!(error["error"]["code"], "SERVER_ERROR");
        assert!(!body.contains("[DONE]"));
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dropping_body_drops_upstream_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        // yields one chunk, then stays open while holding the flag
        let chunks: ChunkStream = Box::pin(futures::stream::unfold(
            (flag, false),
            |(flag, sent)| async move {
                if sent {
                    futures::future::pending::<()>().await;
                }
                Some((Ok::<_, AdapterError>(CanonicalChunk::text("first")), (flag, true)))
            },
        ));

        let response = create_sse_response(RequestKind::Chat, "gpt-4".to_string(), chunks);
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("first"));
        assert!(!dropped.load(Ordering::SeqCst));

        drop(body);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
