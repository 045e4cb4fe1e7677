//! In-process provider doubles and request helpers shared by the API tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::{TimeZone, Utc};
use futures::stream;
use tower::ServiceExt;

use chat_relay::config::Config;
use chat_relay::identity::{DecodedToken, IdentityError, IdentityProvider, ProfileUpdate, UserRecord};
use chat_relay::llm::{ChatBackend, Completion, CompletionRequest, FragmentStream, LlmError};
use chat_relay::server::routes::{build_router, AppState};

pub const VALID_TOKEN: &str = "valid-token";
pub const EXPIRED_TOKEN: &str = "expired-token";
pub const DISABLED_TOKEN: &str = "disabled-token";
pub const ORPHAN_TOKEN: &str = "orphan-token";
/// Verifies, but the account behind it no longer exists.
pub const DELETED_TOKEN: &str = "deleted-token";
pub const REJECTED_PHOTO: &str = "not-a-url";

/// Identity provider that knows a fixed set of tokens.
#[derive(Default)]
pub struct MockIdentity {
    pub verify_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
    pub updates: Mutex<Vec<(String, ProfileUpdate)>>,
}

impl MockIdentity {
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn verify_id_token(&self, token: &str) -> Result<DecodedToken, IdentityError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let uid = match token {
            VALID_TOKEN => "user-1",
            DISABLED_TOKEN => "user-disabled",
            ORPHAN_TOKEN => "user-gone",
            DELETED_TOKEN => "user-deleted",
            EXPIRED_TOKEN => return Err(IdentityError::TokenExpired),
            _ => return Err(IdentityError::InvalidToken("bad signature".to_string())),
        };
        Ok(DecodedToken {
            uid: uid.to_string(),
            email: Some(format!("{uid}@example.com")),
            name: None,
            picture: None,
        })
    }

    async fn get_user(&self, uid: &str) -> Result<UserRecord, IdentityError> {
        let calls = self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        match uid {
            "user-gone" if calls > 0 => Err(IdentityError::UserNotFound(uid.to_string())),
            "user-1" | "user-disabled" | "user-gone" => Ok(UserRecord {
                uid: uid.to_string(),
                email: Some(format!("{uid}@example.com")),
                display_name: Some("Test User".to_string()),
                photo_url: None,
                email_verified: true,
                disabled: uid == "user-disabled",
                created_at: Utc.timestamp_millis_opt(1_700_000_000_000).single(),
                last_login_at: None,
            }),
            _ => Err(IdentityError::UserNotFound(uid.to_string())),
        }
    }

    async fn update_user(&self, uid: &str, update: &ProfileUpdate) -> Result<(), IdentityError> {
        if update.photo_url.as_deref() == Some(REJECTED_PHOTO) {
            return Err(IdentityError::Rejected(
                "The photoURL field must be a valid URL.".to_string(),
            ));
        }
        self.updates
            .lock()
            .unwrap()
            .push((uid.to_string(), update.clone()));
        Ok(())
    }
}

/// What the LLM double answers with.
#[derive(Clone)]
pub enum Reply {
    Complete(Completion),
    Stream(Vec<Result<String, LlmError>>),
    Fail(LlmError),
}

/// LLM backend that replays a canned reply and records requests.
pub struct MockLlm {
    pub reply: Reply,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl MockLlm {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn record(&self, request: &CompletionRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
    }
}

#[async_trait]
impl ChatBackend for MockLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.record(request);
        match &self.reply {
            Reply::Complete(c) => Ok(c.clone()),
            Reply::Stream(_) => Err(LlmError::Malformed("stream reply for complete()".to_string())),
            Reply::Fail(e) => Err(e.clone()),
        }
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        self.record(request);
        match &self.reply {
            Reply::Stream(items) => Ok(Box::pin(stream::iter(items.clone()))),
            Reply::Complete(c) => Ok(Box::pin(stream::iter(vec![Ok(c.content.clone())]))),
            Reply::Fail(e) => Err(e.clone()),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub identity: Arc<MockIdentity>,
    pub llm: Arc<MockLlm>,
}

impl TestApp {
    pub fn new(reply: Reply) -> Self {
        Self::with_config(Config::default(), reply)
    }

    pub fn with_config(config: Config, reply: Reply) -> Self {
        let identity = Arc::new(MockIdentity::default());
        let llm = Arc::new(MockLlm::new(reply));
        let state = Arc::new(AppState {
            config: Arc::new(config),
            identity: identity.clone(),
            llm: llm.clone(),
            start_time: Instant::now(),
        });
        Self {
            router: build_router(state),
            identity,
            llm,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub fn hi_completion() -> Reply {
    Reply::Complete(Completion {
        content: "Hi".to_string(),
        total_tokens: 5,
    })
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let text = body_text(response).await;
    (status, serde_json::from_str(&text).unwrap())
}
