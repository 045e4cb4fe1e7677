//! SSE (Server-Sent Events) streaming for incremental completions.
//!
//! Converts the upstream fragment stream into `data: {"content": ...}` frames
//! and appends the `data: [DONE]` sentinel.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::upstream_status;
use crate::llm::FragmentStream;

/// One incremental frame.
#[derive(Debug, Serialize)]
pub struct ContentFrame {
    pub content: String,
}

/// Frame sent when the upstream fails after streaming began.
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    pub error: String,
}

/// Convert a fragment stream into an SSE event stream.
///
/// Each fragment becomes its own event, in arrival order. After the first
/// upstream error one error frame is sent and the stream is closed.
pub fn fragments_to_sse_stream(
    fragments: FragmentStream,
    request_id: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let sent = Arc::new(AtomicUsize::new(0));
    let counter = sent.clone();
    let mut failed = false;

    fragments
        .take_while(move |item| {
            let keep = !failed;
            failed |= item.is_err();
            future::ready(keep)
        })
        .map(move |item| {
            let data = match item {
                Ok(content) => {
                    counter.fetch_add(1, Ordering::Relaxed);
                    serde_json::to_string(&ContentFrame { content })
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream failed");
                    let (_, message) = upstream_status(&e);
                    serde_json::to_string(&ErrorFrame { error: message })
                }
            };
            Ok(Event::default().data(data.unwrap_or_default()))
        })
        // Append the [DONE] sentinel after all events.
        .chain(stream::once(async move {
            info!(
                request_id = %request_id,
                fragments = sent.load(Ordering::Relaxed),
                "Stream complete"
            );
            Ok(Event::default().data("[DONE]"))
        }))
}

/// Build the `text/event-stream` response for a fragment stream.
pub fn sse_response(fragments: FragmentStream, request_id: String) -> Response {
    let stream = fragments_to_sse_stream(fragments, request_id);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    // Reverse proxies must not buffer the stream.
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
