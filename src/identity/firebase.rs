//! Firebase Authentication backend.
//!
//! ID tokens are RS256 JWTs signed with Google's rotating `securetoken` keys.
//! User records are read and written through the Identity Toolkit REST API,
//! authorised with an OAuth2 access token minted from the service account.
//!
//! Two caches live here: the published signing keys (for as long as Google's
//! `Cache-Control: max-age` allows) and the service-account access token
//! (until shortly before it expires). Verification results are never cached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{IdentityConfig, ServiceAccount};
use crate::identity::{DecodedToken, IdentityError, IdentityProvider, ProfileUpdate, UserRecord};

const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(3600);
const ACCESS_TOKEN_LIFETIME_SECS: i64 = 3600;
const ACCESS_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const OAUTH_SCOPES: &str =
    "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/identitytoolkit";

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    #[serde(default)]
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    expires_at: Instant,
}

struct CachedAccessToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    local_id: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<WireUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    disabled: bool,
    /// Milliseconds since the epoch, as a string.
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    last_login_at: Option<String>,
}

impl From<WireUser> for UserRecord {
    fn from(user: WireUser) -> Self {
        UserRecord {
            uid: user.local_id,
            email: user.email,
            display_name: user.display_name,
            photo_url: user.photo_url,
            email_verified: user.email_verified,
            disabled: user.disabled,
            created_at: parse_millis(user.created_at.as_deref()),
            last_login_at: parse_millis(user.last_login_at.as_deref()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest<'a> {
    local_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    photo_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn parse_millis(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Read `max-age` from a `Cache-Control` header value.
fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Firebase-backed [`IdentityProvider`].
pub struct FirebaseAuth {
    client: reqwest::Client,
    config: IdentityConfig,
    project_id: String,
    client_email: String,
    signing_key: EncodingKey,
    issuer: String,
    keys: RwLock<Option<CachedKeys>>,
    access_token: RwLock<Option<CachedAccessToken>>,
}

impl FirebaseAuth {
    /// Build the client. Fails if the service-account key is not a valid RSA PEM.
    pub fn new(config: IdentityConfig, account: ServiceAccount) -> Result<Self, IdentityError> {
        let signing_key = EncodingKey::from_rsa_pem(account.private_key.as_bytes()).map_err(|e| {
            IdentityError::Unavailable(format!("invalid service-account private key: {e}"))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IdentityError::Unavailable(format!("failed to build http client: {e}")))?;

        info!(project_id = %account.project_id, "Firebase identity provider configured");

        Ok(Self {
            client,
            issuer: format!("{}{}", config.issuer_prefix, account.project_id),
            config,
            project_id: account.project_id,
            client_email: account.client_email,
            signing_key,
            keys: RwLock::new(None),
            access_token: RwLock::new(None),
        })
    }

    /// Seed the signing-key cache, bypassing the JWK endpoint.
    #[cfg(test)]
    pub(crate) async fn install_verification_key(&self, kid: &str, key: DecodingKey, ttl: Duration) {
        let mut guard = self.keys.write().await;
        let cache = guard.get_or_insert_with(|| CachedKeys {
            keys: HashMap::new(),
            expires_at: Instant::now() + ttl,
        });
        cache.keys.insert(kid.to_string(), key);
        cache.expires_at = Instant::now() + ttl;
    }

    async fn verification_key(&self, kid: &str) -> Result<DecodingKey, IdentityError> {
        {
            let guard = self.keys.read().await;
            if let Some(cache) = guard.as_ref().filter(|c| c.expires_at > Instant::now()) {
                return cache
                    .keys
                    .get(kid)
                    .cloned()
                    .ok_or_else(|| IdentityError::InvalidToken(format!("unknown key id {kid}")));
            }
        }

        let fresh = self.fetch_keys().await?;
        let key = fresh.keys.get(kid).cloned();
        *self.keys.write().await = Some(fresh);
        key.ok_or_else(|| IdentityError::InvalidToken(format!("unknown key id {kid}")))
    }

    async fn fetch_keys(&self) -> Result<CachedKeys, IdentityError> {
        let response = self
            .client
            .get(&self.config.jwks_url)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("jwks fetch error: {e}")))?;

        if !response.status().is_success() {
            return Err(IdentityError::Unavailable(format!(
                "jwks fetch status: {}",
                response.status()
            )));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .unwrap_or(DEFAULT_KEYS_TTL);

        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("jwks decode error: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in set.keys {
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                warn!(kid = %jwk.kid, kty = %jwk.kty, "Skipping JWK without RSA components");
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(key) => {
                    keys.insert(jwk.kid, key);
                }
                Err(err) => warn!(kid = %jwk.kid, error = %err, "Skipping unusable JWK"),
            }
        }

        debug!(keys = keys.len(), ttl_secs = ttl.as_secs(), "Refreshed token signing keys");
        Ok(CachedKeys {
            keys,
            expires_at: Instant::now() + ttl,
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iat", "aud", "iss", "sub"]);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&self.project_id));
        validation
    }

    async fn bearer(&self) -> Result<String, IdentityError> {
        {
            let guard = self.access_token.read().await;
            if let Some(cached) = guard.as_ref().filter(|t| t.refresh_at > Instant::now()) {
                return Ok(cached.token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: OAUTH_SCOPES,
            aud: &self.config.token_url,
            iat: now,
            exp: now + ACCESS_TOKEN_LIFETIME_SECS,
        };
        let assertion =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
                .map_err(|e| IdentityError::Unavailable(format!("failed to sign assertion: {e}")))?;

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("token exchange failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Unavailable(format!(
                "token exchange status {status}: {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("token decode error: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(ACCESS_TOKEN_REFRESH_MARGIN);
        *self.access_token.write().await = Some(CachedAccessToken {
            token: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    fn accounts_url(&self, operation: &str) -> String {
        format!(
            "{}/projects/{}/accounts:{operation}",
            self.config.identity_toolkit_url.trim_end_matches('/'),
            self.project_id
        )
    }

    async fn call<B: Serialize>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<reqwest::Response, IdentityError> {
        let bearer = self.bearer().await?;
        let response = self
            .client
            .post(self.accounts_url(operation))
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("accounts:{operation} failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        if status == reqwest::StatusCode::BAD_REQUEST {
            Err(IdentityError::Rejected(message))
        } else {
            Err(IdentityError::Unavailable(format!(
                "accounts:{operation} status {status}: {message}"
            )))
        }
    }
}

/// Map a `jsonwebtoken` failure onto the provider error classification.
fn classify_jwt_error(err: jsonwebtoken::errors::Error) -> IdentityError {
    match err.kind() {
        ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
        _ => IdentityError::InvalidToken(err.to_string()),
    }
}

#[async_trait]
impl IdentityProvider for FirebaseAuth {
    async fn verify_id_token(&self, token: &str) -> Result<DecodedToken, IdentityError> {
        let header = jsonwebtoken::decode_header(token).map_err(classify_jwt_error)?;
        if header.alg != Algorithm::RS256 {
            return Err(IdentityError::InvalidToken(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| IdentityError::InvalidToken("token has no kid header".to_string()))?;

        let key = self.verification_key(&kid).await?;
        let data = jsonwebtoken::decode::<IdTokenClaims>(token, &key, &self.validation())
            .map_err(classify_jwt_error)?;

        let claims = data.claims;
        if claims.sub.is_empty() || claims.sub.len() > 128 {
            return Err(IdentityError::InvalidToken("invalid sub claim".to_string()));
        }

        Ok(DecodedToken {
            uid: claims.sub,
            email: claims.email,
            name: claims.name,
            picture: claims.picture,
        })
    }

    async fn get_user(&self, uid: &str) -> Result<UserRecord, IdentityError> {
        let response = match self.call("lookup", &LookupRequest { local_id: [uid] }).await {
            Err(IdentityError::Rejected(message)) if message.starts_with("USER_NOT_FOUND") => {
                return Err(IdentityError::UserNotFound(uid.to_string()))
            }
            other => other?,
        };

        let lookup: LookupResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("lookup decode error: {e}")))?;

        lookup
            .users
            .into_iter()
            .next()
            .map(UserRecord::from)
            .ok_or_else(|| IdentityError::UserNotFound(uid.to_string()))
    }

    async fn update_user(&self, uid: &str, update: &ProfileUpdate) -> Result<(), IdentityError> {
        let body = UpdateRequest {
            local_id: uid,
            display_name: update.display_name.as_deref(),
            photo_url: update.photo_url.as_deref(),
        };
        match self.call("update", &body).await {
            Ok(_) => {
                debug!(uid, "accounts:update accepted");
                Ok(())
            }
            Err(IdentityError::Rejected(message)) if message.starts_with("USER_NOT_FOUND") => {
                Err(IdentityError::UserNotFound(uid.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}
