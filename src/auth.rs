use std::sync::Arc;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::error;

use crate::config::AppConfig;
use crate::entitlement::Tier;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// Session tokens stay valid for a week.
const SESSION_VALIDITY_DAYS: i64 = 7;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
struct Claims {
    sub: i32,
    email: String,
    role: String,
    exp: usize,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Serialize)]
pub struct UserInfo {
    pub id: i32,
    pub email: String,
    pub role: String,
    pub tier: Tier,
    pub used_quota: i64,
    pub quota_ceiling: i64,
}

/// Login keys are matched case-insensitively, so emails are stored lower-cased.
fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub async fn register_user(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<StatusCode> {
    let email = normalize_email(&payload.email);
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("Valid email required".into()));
    }
    if payload.password.len() < 8 {
        return Err(AppError::BadRequest("Password too short".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|e| AppError::Message(format!("Hashing failed: {}", e)))?;
    let result = sqlx::query("INSERT INTO users (email, password_hash) VALUES ($1, $2)")
        .bind(&email)
        .bind(hash.to_string())
        .execute(&pool)
        .await;
    match result {
        Ok(_) => Ok(StatusCode::CREATED),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("users_email_key") {
                    return Err(AppError::Conflict("Email already registered".into()));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

pub async fn login_user(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<LoginResponse>)> {
    let email = normalize_email(&payload.email);
    let rec = sqlx::query("SELECT id, email, password_hash, role FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching user");
            AppError::Db(e)
        })?;
    // Unknown email and wrong password take the same exit so the response
    // never reveals whether the account exists.
    let rec = rec.ok_or(AppError::Unauthorized)?;
    let id: i32 = rec.get("id");
    let stored_email: String = rec.get("email");
    let pass_hash: String = rec.get("password_hash");
    let role: String = rec.get("role");
    let parsed = PasswordHash::new(&pass_hash).map_err(|e| {
        error!(?e, "Hash parse error");
        AppError::Message(format!("Hash error: {}", e))
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthorized);
    }
    let exp = Utc::now()
        .checked_add_signed(Duration::days(SESSION_VALIDITY_DAYS))
        .expect("valid timestamp")
        .timestamp() as usize;
    let claims = Claims {
        sub: id,
        email: stored_email,
        role,
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        error!(?e, "Token encoding error");
        AppError::Message("Token error".into())
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("auth_token={token}; HttpOnly; Secure; SameSite=Strict; Path=/")
            .parse()
            .expect("valid header value"),
    );
    Ok((headers, Json(LoginResponse { token })))
}

pub async fn logout_user() -> (HeaderMap, &'static str) {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        "auth_token=deleted; HttpOnly; Path=/; Max-Age=0"
            .parse()
            .expect("valid header value"),
    );
    (headers, "Logged out")
}

pub async fn current_user(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    AuthUser { user_id, role, .. }: AuthUser,
) -> AppResult<Json<UserInfo>> {
    let rec = sqlx::query("SELECT email, tier, used_quota FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching user");
            AppError::Db(e)
        })?;
    let Some(row) = rec else {
        return Err(AppError::NotFound);
    };
    let email: String = row.get("email");
    let tier = Tier::from_db(row.get::<String, _>("tier").as_str());
    let used_quota: i64 = row.get("used_quota");
    Ok(Json(UserInfo {
        id: user_id,
        email,
        role,
        tier,
        used_quota,
        quota_ceiling: config.quota.ceiling(tier),
    }))
}

#[derive(Deserialize)]
pub struct SetTierRequest {
    /// Defaults to the caller's own account.
    pub user_id: Option<i32>,
    pub tier: String,
}

/// Direct tier set, constrained to the three known tiers. The payment webhook
/// is the normal upgrade path; this one requires the admin role.
pub async fn set_tier(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, role, .. }: AuthUser,
    Json(payload): Json<SetTierRequest>,
) -> AppResult<StatusCode> {
    if role != "admin" {
        return Err(AppError::Forbidden);
    }
    let tier = Tier::parse(&payload.tier)
        .ok_or_else(|| AppError::BadRequest("Unknown tier".into()))?;
    let target = payload.user_id.unwrap_or(user_id);
    let result = sqlx::query("UPDATE users SET tier = $1 WHERE id = $2")
        .bind(tier.as_str())
        .bind(target)
        .execute(&pool)
        .await
        .map_err(|e| {
            error!(?e, "DB error setting tier");
            AppError::Db(e)
        })?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}
