use std::sync::Arc;

use axum::{body::Bytes, extract::Extension, http::HeaderMap, http::StatusCode};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::config::AppConfig;
use crate::entitlement::Tier;
use crate::error::{AppError, AppResult};

pub const SIGNATURE_HEADER: &str = "x-copydesk-signature";

/// key: billing-events -> signed webhook payloads
#[derive(Debug, Deserialize)]
pub struct BillingEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// HMAC-SHA256 over the raw body, compared against a `sha256=<hex>` header.
/// Nothing in the payload is trusted until this passes.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(body);
    let expected = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    expected == header
}

/// Extracts the tier mutation a verified event calls for, if any. Only
/// activation/renewal kinds mutate, and only toward a paid tier: this path
/// never downgrades an account to `free`, on purpose.
pub fn tier_change(event: &BillingEvent) -> Option<(i32, Tier)> {
    if event.event != "subscription.activated" && event.event != "subscription.renewed" {
        return None;
    }
    let metadata = &event.data["metadata"];
    let user_id = metadata["user_id"]
        .as_i64()
        .or_else(|| metadata["user_id"].as_str().and_then(|s| s.parse().ok()))
        .and_then(|id| i32::try_from(id).ok())?;
    let tier = match metadata["tier"].as_str()? {
        "pro" => Tier::Pro,
        "premium" => Tier::Premium,
        _ => return None,
    };
    Some((user_id, tier))
}

/// Webhook entrypoint. The signature check runs before any parsing or account
/// lookup; everything validly signed is acknowledged with 200 so the provider
/// stops retrying, even when the internal apply fails (that gets logged, a
/// retry cannot fix it).
pub async fn billing_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::SignatureInvalid)?;
    if !verify_signature(&config.billing_webhook_secret, &body, signature) {
        return Err(AppError::SignatureInvalid);
    }

    let event: BillingEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(?e, "validly signed but unparseable billing event");
            return Ok(StatusCode::OK);
        }
    };

    let Some((user_id, tier)) = tier_change(&event) else {
        return Ok(StatusCode::OK);
    };

    // A plain set, so replaying the same event lands on the same tier.
    match sqlx::query("UPDATE users SET tier = $1 WHERE id = $2")
        .bind(tier.as_str())
        .bind(user_id)
        .execute(&pool)
        .await
    {
        Ok(result) if result.rows_affected() == 0 => {
            warn!(user_id, "billing event referenced unknown account");
        }
        Ok(_) => {
            tracing::info!(user_id, tier = tier.as_str(), "applied billing event");
        }
        Err(e) => {
            error!(?e, user_id, "failed to apply billing event");
        }
    }
    Ok(StatusCode::OK)
}
