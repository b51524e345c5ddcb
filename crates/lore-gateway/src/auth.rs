use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::app::AppState;
use crate::envelope::ApiError;
use lore_store::types::User;

/// JWT claims: `sub` is the user id, `iat` drives password-change
/// revocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn issue_token(secret: &str, expire_hours: i64, user: &User) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id.to_string(),
        username: user.username.clone(),
        role: user.role.clone(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::hours(expire_hours)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::internal(format!("token issue failed: {}", e)))
}

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::unauthorized("invalid or expired token"))
}

/// The authenticated caller. Token is taken from `Authorization: Bearer`,
/// the `X-Token` header, or a `?token=` query parameter, in that order.
pub struct CurrentUser(pub User);

/// Same as [`CurrentUser`] but rejects non-admin roles with 403.
pub struct AdminUser(pub User);

fn extract_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = parts.headers.get("x-token") {
        if let Ok(value) = value.to_str() {
            return Some(value.to_string());
        }
    }
    parts.uri.query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|token| token.to_string())
        })
    })
}

async fn authenticate(parts: &Parts, state: &Arc<AppState>) -> Result<User, ApiError> {
    let token = extract_token(parts)
        .ok_or_else(|| ApiError::unauthorized("not authenticated, please log in"))?;

    let claims = decode_token(&state.config.security.jwt_secret, &token)?;
    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| ApiError::unauthorized("token carries no user id"))?;

    let user = state
        .users
        .get(user_id)
        .map_err(|_| ApiError::unauthorized("user no longer exists"))?;

    if user.status != 1 {
        return Err(ApiError::forbidden("user account is disabled"));
    }

    // A password change after issuance revokes the token.
    if let Some(changed_at) = &user.password_changed_at {
        if let Ok(changed) = chrono::DateTime::parse_from_rfc3339(changed_at) {
            let issued = Utc
                .timestamp_opt(claims.iat, 0)
                .single()
                .unwrap_or_else(Utc::now);
            if changed.with_timezone(&Utc) > issued {
                return Err(ApiError::unauthorized(
                    "password changed, please log in again",
                ));
            }
        }
    }

    Ok(user)
}

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        authenticate(parts, state).await.map(CurrentUser)
    }
}

impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user = authenticate(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::forbidden("admin privileges required"));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn user() -> User {
        User {
            id: 42,
            username: "alice".to_string(),
            email: "a@x.io".to_string(),
            password_hash: String::new(),
            role: "user".to_string(),
            status: 1,
            password_changed_at: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn token_round_trip_preserves_claims() {
        let token = issue_token(SECRET, 24, &user()).unwrap();
        let claims = decode_token(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, "user");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue_token(SECRET, 24, &user()).unwrap();
        assert!(decode_token("another-secret-another-secret!!!", &token).is_err());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(decode_token(SECRET, "not-a-jwt").is_err());
    }
}
