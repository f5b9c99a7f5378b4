use std::sync::Arc;

use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Deserialize)]
struct Claims {
    sub: i32,
    email: String,
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

pub struct AuthUser {
    pub user_id: i32,
    pub email: String,
    pub role: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        } else {
            None
        };
        // A missing token is reported distinctly from a malformed or expired one.
        let token = token_opt.ok_or(AppError::Unauthenticated)?;
        let config = parts
            .extensions
            .get::<Arc<AppConfig>>()
            .ok_or_else(|| AppError::Message("config missing from request extensions".into()))?;
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
            role: decoded.claims.role,
        })
    }
}
