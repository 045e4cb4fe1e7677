//! Profile route group, mounted under `/api/auth`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::ApiError;
use crate::identity::{AuthenticatedIdentity, IdentityError, ProfileUpdate, UserRecord};
use crate::server::chat::Ack;
use crate::server::extract::JsonOrForm;
use crate::server::routes::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/profile", get(get_profile).put(update_profile))
}

/// Profile as returned to the client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub email_verified: bool,
    pub created_at: Option<String>,
    pub last_login_at: Option<String>,
}

fn rfc3339(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl From<UserRecord> for ProfileResponse {
    fn from(record: UserRecord) -> Self {
        Self {
            uid: record.uid,
            email: record.email,
            display_name: record.display_name,
            photo_url: record.photo_url,
            email_verified: record.email_verified,
            created_at: rfc3339(record.created_at),
            last_login_at: rfc3339(record.last_login_at),
        }
    }
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AuthenticatedIdentity>,
) -> Result<Json<ProfileResponse>, ApiError> {
    match state.identity.get_user(&identity.uid).await {
        Ok(record) => Ok(Json(record.into())),
        Err(IdentityError::UserNotFound(_)) => Err(ApiError::NotFound("User not found".to_string())),
        Err(e) => Err(ApiError::Internal(format!(
            "profile lookup for {}: {e}",
            identity.uid
        ))),
    }
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<AuthenticatedIdentity>,
    JsonOrForm(update): JsonOrForm<ProfileUpdate>,
) -> Result<Json<Ack>, ApiError> {
    if update.is_empty() {
        return Err(ApiError::BadRequest("No profile fields provided".to_string()));
    }

    match state.identity.update_user(&identity.uid, &update).await {
        Ok(()) => {
            info!(uid = %identity.uid, "Profile updated");
            Ok(Json(Ack {
                success: true,
                message: "Profile updated successfully".to_string(),
            }))
        }
        Err(IdentityError::Rejected(message)) => Err(ApiError::BadRequest(message)),
        Err(IdentityError::UserNotFound(_)) => Err(ApiError::NotFound("User not found".to_string())),
        Err(e) => Err(ApiError::Internal(format!(
            "profile update for {}: {e}",
            identity.uid
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_profile_field_names() {
        let record = UserRecord {
            uid: "u1".to_string(),
            email: Some("a@example.com".to_string()),
            display_name: Some("Ada".to_string()),
            photo_url: None,
            email_verified: true,
            disabled: false,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).single(),
            last_login_at: None,
        };
        let value = serde_json::to_value(ProfileResponse::from(record)).unwrap();
        assert_eq!(value["uid"], "u1");
        assert_eq!(value["displayName"], "Ada");
        assert_eq!(value["photoURL"], serde_json::Value::Null);
        assert_eq!(value["emailVerified"], true);
        assert_eq!(value["createdAt"], "2023-11-14T22:13:20.000Z");
        assert_eq!(value["lastLoginAt"], serde_json::Value::Null);
    }
}
