use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::Extension, Json};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::error;

use crate::config::AppConfig;
use crate::entitlement::{admit, estimate_cost, Admission, Tier};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::ledger::UsageLedger;

const SYSTEM_PROMPT: &str =
    "You are a professional copywriter. Produce clear, well-structured prose. \
     Start with a short title on its own line.";

/// Returned when the provider answers 200 but the expected fields are absent.
pub const PLACEHOLDER_CONTENT: &str =
    "The writing service returned an empty response. Please try again.";

const DEFAULT_OUTPUT_BUDGET: i64 = 2048;
/// Caller-supplied output budgets are capped so the cost arithmetic stays far
/// from i64 territory and the provider never sees an unbounded max_tokens.
const MAX_OUTPUT_BUDGET: i64 = 100_000;
const DEMO_OUTPUT_BUDGET: i64 = 256;

/// Seam for the external text-generation capability so tests can stub it.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    async fn complete(&self, messages: Value, max_output_units: i64) -> AppResult<String>;
}

/// key: generation-gateway -> chat completions client
pub struct GenerationClient {
    base: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GenerationClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            base: config.generation_api_base.trim_end_matches('/').to_string(),
            api_key: config.generation_api_key.clone(),
            model: config.generation_model.clone(),
            client: Client::builder()
                .timeout(config.generation_timeout)
                .build()
                .expect("client build"),
        }
    }
}

#[async_trait]
impl GenerationApi for GenerationClient {
    async fn complete(&self, messages: Value, max_output_units: i64) -> AppResult<String> {
        let url = format!("{}/v1/chat/completions", self.base);
        // Timeouts and transport errors surface here as upstream failures, so
        // no quota is ever charged for them.
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": max_output_units,
            }))
            .send()
            .await
            .map_err(|e| {
                error!(?e, "generation request failed");
                AppError::Upstream("generation request failed".into())
            })?;
        if !resp.status().is_success() {
            error!(status = %resp.status(), "generation provider error");
            return Err(AppError::Upstream(format!(
                "generation provider returned {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await.map_err(|e| {
            error!(?e, "generation response decode failed");
            AppError::Upstream("generation response decode failed".into())
        })?;
        // A 200 with missing fields degrades to a placeholder instead of a fault.
        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| PLACEHOLDER_CONTENT.to_string()))
    }
}

/// The leading non-empty line doubles as the title when none was asked for.
pub fn derive_title(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .unwrap_or_else(|| "Untitled".to_string())
}

fn user_prompt(topic: &str) -> String {
    format!("Write a well-structured article about {topic}.")
}

#[derive(Deserialize)]
pub struct GenerateRequest {
    pub topic: String,
    pub max_output_units: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub title: String,
    pub content: String,
    pub cost: i64,
    pub used_quota: i64,
    pub quota_ceiling: i64,
}

/// Metered generation: estimate, admit, call the gateway, then charge and
/// record in one transaction. Order matters: a denied attempt touches
/// nothing, a failed gateway call leaves the counter unchanged.
pub async fn generate(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(gateway): Extension<Arc<dyn GenerationApi>>,
    AuthUser { user_id, .. }: AuthUser,
    Json(payload): Json<GenerateRequest>,
) -> AppResult<Json<GenerateResponse>> {
    let topic = payload.topic.trim().to_string();
    if topic.is_empty() {
        return Err(AppError::BadRequest("Topic required".into()));
    }
    let output_budget = payload.max_output_units.unwrap_or(DEFAULT_OUTPUT_BUDGET);
    if !(1..=MAX_OUTPUT_BUDGET).contains(&output_budget) {
        return Err(AppError::BadRequest(format!(
            "Output budget must be between 1 and {MAX_OUTPUT_BUDGET}"
        )));
    }

    let ledger = UsageLedger::new(pool);
    let (stored_tier, used) = ledger
        .usage_of(user_id)
        .await
        .map_err(|e| {
            error!(?e, "DB error while fetching usage");
            AppError::Message("Failed to read usage".into())
        })?
        .ok_or(AppError::NotFound)?;
    let tier = Tier::from_db(&stored_tier);

    let prompt = user_prompt(&topic);
    let cost = estimate_cost(&prompt, output_budget);
    let ceiling = config.quota.ceiling(tier);
    // Known race: two concurrent generations for one account can both pass
    // this check before either charges. The charge itself is additive, so the
    // counter stays consistent and can only overshoot by one in-flight cost.
    if let Admission::Denied { used, ceiling } = admit(used, cost, ceiling) {
        return Err(AppError::QuotaExceeded { used, ceiling });
    }

    let messages = json!([
        {"role": "system", "content": SYSTEM_PROMPT},
        {"role": "user", "content": prompt},
    ]);
    let content = gateway.complete(messages, output_budget).await?;

    ledger
        .charge_and_record(user_id, cost, &topic, &content)
        .await
        .map_err(|e| {
            error!(?e, "ledger write failed after successful generation");
            AppError::Message("Failed to record generation".into())
        })?;

    Ok(Json(GenerateResponse {
        title: derive_title(&content),
        content,
        cost,
        used_quota: used + cost,
        quota_ceiling: ceiling,
    }))
}

#[derive(Deserialize)]
pub struct DemoGenerateRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct DemoGenerateResponse {
    pub title: String,
    pub content: String,
}

/// Quota-exempt demo path: no authentication, no admission check, no charge,
/// no history row. A single-shot prompt goes straight to the gateway.
pub async fn demo_generate(
    Extension(gateway): Extension<Arc<dyn GenerationApi>>,
    Json(payload): Json<DemoGenerateRequest>,
) -> AppResult<Json<DemoGenerateResponse>> {
    let prompt = payload.prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::BadRequest("Prompt required".into()));
    }
    let messages = json!([{"role": "user", "content": prompt}]);
    let content = gateway.complete(messages, DEMO_OUTPUT_BUDGET).await?;
    Ok(Json(DemoGenerateResponse {
        title: derive_title(&content),
        content,
    }))
}
