//! Client for OpenAI-compatible chat-completion APIs.
//!
//! One `reqwest::Client` is built at start-up and shared by every request.
//! The client carries only a connect timeout; whole-call and per-chunk bounds
//! are applied per request so that long streams are not cut off.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::LlmConfig;
use crate::llm::sse::content_fragments;
use crate::llm::{ChatBackend, ChatMessage, Completion, CompletionRequest, FragmentStream, LlmError};

/// Wire body of `POST /chat/completions`.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<WireResponse> for Completion {
    fn from(wire: WireResponse) -> Self {
        let content = wire
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();
        let total_tokens = wire.usage.and_then(|u| u.total_tokens).unwrap_or(0);
        Completion {
            content,
            total_tokens,
        }
    }
}

/// OpenAI-compatible chat backend.
pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
        })
    }

    /// Send the request and return the response once its headers arrive.
    ///
    /// Non-stream calls carry `request_timeout` as a reqwest per-request
    /// timeout, which keeps running while the body is read. Stream calls
    /// bound only the wait for headers; the body is bounded per chunk.
    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = WireRequest {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);

        let response = if stream {
            tokio::time::timeout(self.request_timeout, builder.send())
                .await
                .map_err(|_| LlmError::Timeout)?
                .map_err(transport_error)?
        } else {
            builder
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(transport_error)?
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::time::timeout(self.stream_idle_timeout, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let err = LlmError::from_status(status.as_u16(), &body);
        match &err {
            LlmError::Unauthorized { .. } => {
                error!(status = status.as_u16(), "LLM provider rejected the configured API key")
            }
            _ => warn!(status = status.as_u16(), body = %body, "LLM provider returned an error"),
        }
        Err(err)
    }
}

fn transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        return LlmError::Timeout;
    }
    error!(error = %e, "LLM provider request failed");
    LlmError::Provider {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;

        // Still under the per-request deadline set in `send`.
        let wire: WireResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Malformed(e.to_string())
            }
        })?;

        let completion = Completion::from(wire);
        debug!(
            model = %request.model,
            tokens = completion.total_tokens,
            "Completion received"
        );
        Ok(completion)
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<FragmentStream, LlmError> {
        let response = self.send(request, true).await?;

        let bytes = tokio_stream::StreamExt::timeout(response.bytes_stream(), self.stream_idle_timeout)
            .map(|item| match item {
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(e)) => Err(transport_error(e)),
                Err(_elapsed) => Err(LlmError::Timeout),
            });

        Ok(content_fragments(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "llama3-8b-8192".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
            temperature: 0.7,
            max_tokens: 64,
        }
    }

    fn client_for(base_url: &str, request_timeout_secs: u64, idle_secs: u64) -> OpenAiClient {
        let config = LlmConfig {
            base_url: base_url.to_string(),
            request_timeout_secs,
            stream_idle_timeout_secs: idle_secs,
            ..LlmConfig::default()
        };
        OpenAiClient::new(&config, "gsk_test".to_string()).unwrap()
    }

    /// One-connection HTTP upstream that writes each part after its delay.
    async fn scripted_upstream(parts: Vec<(Duration, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            for (delay, bytes) in parts {
                tokio::time::sleep(delay).await;
                if socket.write_all(&bytes).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        format!("http://{addr}")
    }

    fn chunk(data: &str) -> Vec<u8> {
        format!("{:x}\r\n{data}\r\n", data.len()).into_bytes()
    }

    async fn collect(stream: FragmentStream) -> Vec<Result<String, LlmError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_complete_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer gsk_test"))
            .and(body_partial_json(json!({"model": "llama3-8b-8192", "stream": false, "max_tokens": 64})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
                "usage": {"total_tokens": 5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = client_for(&server.uri(), 5, 5).complete(&request()).await.unwrap();
        assert_eq!(completion.content, "Hi");
        assert_eq!(completion.total_tokens, 5);
    }

    #[tokio::test]
    async fn test_error_statuses_classified() {
        let cases = [
            (ResponseTemplate::new(429), LlmError::RateLimited),
            (
                ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "Invalid API Key"}})),
                LlmError::Unauthorized { status: 401 },
            ),
            (
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": {"message": "model `x` does not exist"}})),
                LlmError::Provider {
                    status: Some(400),
                    message: "model `x` does not exist".to_string(),
                },
            ),
        ];

        for (template, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(template)
                .mount(&server)
                .await;

            let client = client_for(&server.uri(), 5, 5);
            assert_eq!(client.complete(&request()).await.unwrap_err(), expected);
            assert_eq!(
                client.complete_stream(&request()).await.err(),
                Some(expected)
            );
        }
    }

    #[tokio::test]
    async fn test_stream_over_http() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let stream = client_for(&server.uri(), 5, 5)
            .complete_stream(&request())
            .await
            .unwrap();
        assert_eq!(
            collect(stream).await,
            vec![Ok("Hel".to_string()), Ok("lo".to_string())]
        );
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let started = Instant::now();
        let err = client_for(&server.uri(), 1, 5)
            .complete(&request())
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Timeout);
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_one_deadline_covers_headers_and_body() {
        // Headers and body each arrive within the bound, but not together.
        let body = r#"{"choices":[{"message":{"content":"Hi"}}],"usage":{"total_tokens":5}}"#;
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let base = scripted_upstream(vec![
            (Duration::from_millis(700), head.into_bytes()),
            (Duration::from_millis(700), body.as_bytes().to_vec()),
        ])
        .await;

        let started = Instant::now();
        let result = client_for(&base, 1, 5).complete(&request()).await;
        assert_eq!(result, Err(LlmError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(1350));
    }

    #[tokio::test]
    async fn test_stalled_stream_ends_with_timeout() {
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
        let base = scripted_upstream(vec![
            (Duration::ZERO, head.as_bytes().to_vec()),
            (
                Duration::ZERO,
                chunk("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
            ),
            (Duration::from_secs(3), chunk("data: [DONE]\n\n")),
        ])
        .await;

        let stream = client_for(&base, 5, 1)
            .complete_stream(&request())
            .await
            .unwrap();
        assert_eq!(
            collect(stream).await,
            vec![Ok("Hel".to_string()), Err(LlmError::Timeout)]
        );
    }

    #[test]
    fn test_wire_request_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let body = WireRequest {
            model: "llama3-8b-8192",
            messages: &messages,
            temperature: 0.7,
            max_tokens: 256,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3-8b-8192");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_completion_from_wire() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"Hi"}}],"usage":{"total_tokens":5}}"#,
        )
        .unwrap();
        assert_eq!(
            Completion::from(wire),
            Completion {
                content: "Hi".to_string(),
                total_tokens: 5
            }
        );
    }

    #[test]
    fn test_completion_defaults_when_fields_missing() {
        let wire: WireResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(
            Completion::from(wire),
            Completion {
                content: String::new(),
                total_tokens: 0
            }
        );
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let config = LlmConfig {
            base_url: "http://localhost:11434/v1/".to_string(),
            ..LlmConfig::default()
        };
        let client = OpenAiClient::new(&config, "key".to_string()).unwrap();
        assert_eq!(client.endpoint, "http://localhost:11434/v1/chat/completions");
    }
}
