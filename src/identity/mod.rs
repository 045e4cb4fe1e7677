//! Identity provider integration.
//!
//! - [`firebase`]: Firebase ID-token verification and Identity Toolkit user records
//! - [`gate`]: Middleware that admits only requests carrying a valid bearer token
//!
//! The relay never stores identities; it asks the provider on every request.

pub mod firebase;
pub mod gate;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gate::{require_identity, AuthenticatedIdentity};

/// Claims of a verified ID token.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedToken {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// A user record as held by the provider.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserRecord {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub email_verified: bool,
    pub disabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Profile fields a caller may change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.photo_url.is_none()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    /// The token was well formed but its `exp` has passed.
    #[error("ID token has expired")]
    TokenExpired,

    #[error("invalid ID token: {0}")]
    InvalidToken(String),

    #[error("no user record for uid {0}")]
    UserNotFound(String),

    /// The provider refused the request (e.g. an invalid photo URL).
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),

    /// Transport failure, timeout or unexpected provider response.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Token verification and user-record access.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Check signature, issuer, audience and lifetime of an ID token.
    async fn verify_id_token(&self, token: &str) -> Result<DecodedToken, IdentityError>;

    /// Fetch the current user record.
    async fn get_user(&self, uid: &str) -> Result<UserRecord, IdentityError>;

    /// Apply a profile update for `uid`.
    async fn update_user(&self, uid: &str, update: &ProfileUpdate) -> Result<(), IdentityError>;
}
