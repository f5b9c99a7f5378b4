use std::sync::Arc;

use axum::{extract::Extension, Json};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::error;

use crate::config::AppConfig;
use crate::entitlement::Tier;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// key: billing-checkout -> hosted session creation
pub struct PaymentClient {
    base: String,
    api_key: String,
    success_url: String,
    cancel_url: String,
    client: Client,
}

impl PaymentClient {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let api_key = config.payment_api_key.clone()?;
        Some(Self {
            base: config.payment_api_base.trim_end_matches('/').to_string(),
            api_key,
            success_url: config.checkout_success_url.clone(),
            cancel_url: config.checkout_cancel_url.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
        })
    }

    /// Creates a hosted checkout session for a paid tier. The account id and
    /// target tier travel as opaque metadata so the webhook can correlate the
    /// completed payment back to the account without re-authentication.
    pub async fn create_checkout_session(&self, user_id: i32, tier: Tier) -> AppResult<String> {
        let url = format!("{}/v1/checkout/sessions", self.base);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "mode": "subscription",
                "tier": tier.as_str(),
                "success_url": self.success_url,
                "cancel_url": self.cancel_url,
                "metadata": {
                    "user_id": user_id.to_string(),
                    "tier": tier.as_str(),
                },
            }))
            .send()
            .await
            .map_err(|e| {
                error!(?e, "checkout session request failed");
                AppError::Upstream("checkout session request failed".into())
            })?;
        if !resp.status().is_success() {
            error!(status = %resp.status(), "payment provider error");
            return Err(AppError::Upstream(format!(
                "payment provider returned {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await.map_err(|e| {
            error!(?e, "checkout response decode failed");
            AppError::Upstream("checkout response decode failed".into())
        })?;
        body["url"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Upstream("checkout session missing redirect url".into()))
    }
}

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub tier: String,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub url: String,
}

pub async fn create_checkout(
    Extension(payment): Extension<Option<Arc<PaymentClient>>>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    // Checkout only exists for the paid tiers.
    let tier = match payload.tier.as_str() {
        "pro" => Tier::Pro,
        "premium" => Tier::Premium,
        _ => return Err(AppError::BadRequest("Unknown paid tier".into())),
    };
    let payment =
        payment.ok_or_else(|| AppError::Message("payment provider not configured".into()))?;
    let url = payment.create_checkout_session(user_id, tier).await?;
    Ok(Json(CheckoutResponse { url }))
}
