//! Bearer-token gate for the authenticated route groups.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::identity::{IdentityError, IdentityProvider};

/// The verified caller, available to handlers as `Extension<AuthenticatedIdentity>`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedIdentity {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub verified_at: DateTime<Utc>,
    pub disabled: bool,
}

/// Token from an `Authorization: Bearer <token>` header, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Verify the caller's token and account status before running the inner service.
///
/// Makes no provider call when the header is missing or malformed. Expired
/// tokens get their own response so clients know to re-authenticate; every
/// other verification failure is reported generically and logged.
pub async fn require_identity(
    State(provider): State<Arc<dyn IdentityProvider>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::Unauthorized("Unauthorized: No token provided".to_string()))?
        .to_string();

    let decoded = provider
        .verify_id_token(&token)
        .await
        .map_err(|e| match e {
            IdentityError::TokenExpired => ApiError::TokenExpired,
            other => {
                warn!(error = %other, "Token verification error");
                ApiError::Unauthorized("Invalid authentication token".to_string())
            }
        })?;

    let record = provider.get_user(&decoded.uid).await.map_err(|e| {
        warn!(uid = %decoded.uid, error = %e, "User lookup during verification failed");
        ApiError::Unauthorized("Invalid authentication token".to_string())
    })?;

    if record.disabled {
        debug!(uid = %record.uid, "Rejecting disabled account");
        return Err(ApiError::Forbidden("Account disabled".to_string()));
    }

    request.extensions_mut().insert(AuthenticatedIdentity {
        uid: decoded.uid,
        email: record.email.or(decoded.email),
        name: record.display_name.or(decoded.name),
        picture: record.photo_url.or(decoded.picture),
        verified_at: Utc::now(),
        disabled: record.disabled,
    });

    Ok(next.run(request).await)
}
