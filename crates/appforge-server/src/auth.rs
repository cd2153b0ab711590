//! Request authentication.
//!
//! Two principals: end users carry an RS256 bearer token validated against
//! a JWKS document fetched once and cached; the agent container running for
//! a session authenticates with `X-API-Key == session_id` (protocol-peer
//! auth, accepted only on the internal routes).

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub enum AuthConfig {
    /// Single-tenant local mode: every request is `local`.
    Disabled,
    /// Bearer tokens validated against the cached JWKS.
    Jwks { keys: JwkSet },
}

impl AuthConfig {
    /// Fetch the JWKS once; it is cached for the process lifetime.
    pub async fn from_jwks_url(url: &str) -> Result<Self, String> {
        let keys: JwkSet = reqwest::get(url)
            .await
            .map_err(|e| format!("jwks fetch failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("jwks parse failed: {e}"))?;
        Ok(AuthConfig::Jwks { keys })
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// User identity attached to request extensions by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

pub struct CurrentUser(pub AuthenticatedUser);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized)
    }
}

fn validate_bearer(keys: &JwkSet, token: &str) -> Result<String, ApiError> {
    let header = decode_header(token).map_err(|_| ApiError::Unauthorized)?;
    let kid = header.kid.ok_or(ApiError::Unauthorized)?;
    let jwk = keys.find(&kid).ok_or(ApiError::Unauthorized)?;
    let key = DecodingKey::from_jwk(jwk).map_err(|_| ApiError::Unauthorized)?;
    let mut validation = Validation::new(header.alg);
    validation.validate_aud = false;
    let data = decode::<Claims>(token, &key, &validation).map_err(|_| ApiError::Unauthorized)?;
    Ok(data.claims.sub)
}

/// Resolve the caller on `/api` routes and attach it to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id = match state.auth.as_ref() {
        AuthConfig::Disabled => "local".to_string(),
        AuthConfig::Jwks { keys } => {
            let token = request
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or(ApiError::Unauthorized)?;
            validate_bearer(keys, token)?
        }
    };
    request
        .extensions_mut()
        .insert(AuthenticatedUser { user_id });
    Ok(next.run(request).await)
}

/// Protocol-peer check for internal routes: the key must equal the session
/// id the route addresses.
pub fn require_peer_key(
    headers: &axum::http::HeaderMap,
    session_id: &str,
) -> Result<(), ApiError> {
    let key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    if key != session_id {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}
