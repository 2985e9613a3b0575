//! Authentication extractor.
//!
//! When `AUTH_SECRET` is configured every request must carry it as a bearer
//! token. Without it the control API is open to anonymous callers.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

/// Caller identity extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// `"token"` for an authenticated caller, `"anonymous"` otherwise
    pub client: String,
}

impl AuthUser {
    fn anonymous() -> Self {
        Self {
            client: "anonymous".to_string(),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth_secret.as_deref() else {
            return Ok(AuthUser::anonymous());
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header {
            Some(header) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ");
                if token.is_empty() {
                    return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
                }
                if token != secret {
                    return Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"));
                }
                Ok(AuthUser {
                    client: "token".to_string(),
                })
            }
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
            None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
        }
    }
}
