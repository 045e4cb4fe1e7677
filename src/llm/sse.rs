//! Decoding of the provider's server-sent event stream.
//!
//! OpenAI-compatible APIs stream `data: {chunk}` lines separated by blank
//! lines and finish with `data: [DONE]`. Network chunks do not respect line
//! boundaries, so [`SseDecoder`] buffers partial lines between pushes.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::llm::{FragmentStream, LlmError};

/// One decoded `data:` line.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Line-oriented SSE decoder that tolerates arbitrary chunking.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that arrived without its newline.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(raw: &[u8]) -> Option<SseFrame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);

    // Comments (`: keep-alive`) and `event:`/`id:` fields carry no content.
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);

    if data.trim() == "[DONE]" {
        Some(SseFrame::Done)
    } else if data.trim().is_empty() {
        None
    } else {
        Some(SseFrame::Data(data.to_string()))
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorDetail>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorDetail {
    message: String,
}

/// Extract the new text carried by one chunk, if any.
pub fn chunk_content(json: &str) -> Result<Option<String>, LlmError> {
    let chunk: StreamChunk =
        serde_json::from_str(json).map_err(|e| LlmError::Malformed(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::Provider {
            status: None,
            message: error.message,
        });
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

struct DecodeState {
    bytes: Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    finished: bool,
}

/// Turn a raw provider byte stream into a stream of non-empty text fragments.
///
/// Fragments are yielded in arrival order. The stream ends at `[DONE]`, at the
/// end of the byte stream, or right after the first error it yields.
pub fn content_fragments<S>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, LlmError>> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let fragments = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                match frame {
                    SseFrame::Done => return None,
                    SseFrame::Data(json) => match chunk_content(&json) {
                        Ok(Some(text)) => return Some((Ok(text), state)),
                        Ok(None) => continue,
                        Err(LlmError::Malformed(reason)) => {
                            warn!(%reason, "Skipping unparseable stream chunk");
                            continue;
                        }
                        Err(e) => {
                            state.finished = true;
                            state.pending.clear();
                            return Some((Err(e), state));
                        }
                    },
                }
            }

            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(&chunk);
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    let frames = state.decoder.finish();
                    state.pending.extend(frames);
                }
            }
        }
    });

    Box::pin(fragments)
}
