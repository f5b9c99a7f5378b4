use anyhow::Result;
use axum::{
    extract::{Extension, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Row};
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

/// key: usage-ledger -> charge,history
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationRecord {
    pub id: i32,
    pub user_id: i32,
    pub topic: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Charges the quota and appends the history row in one transaction.
    /// Callers invoke this only after the gateway returned content, so a
    /// failed generation never reaches the ledger.
    pub async fn charge_and_record(
        &self,
        user_id: i32,
        cost: i64,
        topic: &str,
        content: &str,
    ) -> Result<GenerationRecord> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE users SET used_quota = used_quota + $1 WHERE id = $2")
            .bind(cost)
            .bind(user_id)
            .execute(&mut tx)
            .await?;
        let record = sqlx::query_as::<_, GenerationRecord>(
            "INSERT INTO generations (user_id, topic, content) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(user_id)
        .bind(topic)
        .bind(content)
        .fetch_one(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Latest committed counter, straight from the pool. No caching layer sits
    /// in front of this read.
    pub async fn usage_of(&self, user_id: i32) -> Result<Option<(String, i64)>> {
        let row = sqlx::query("SELECT tier, used_quota FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("tier"), r.get("used_quota"))))
    }

    pub async fn history(&self, user_id: i32, limit: i64) -> Result<Vec<GenerationRecord>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let rows = sqlx::query_as::<_, GenerationRecord>(
            "SELECT * FROM generations WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn list_generations(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, .. }: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<GenerationRecord>>> {
    let ledger = UsageLedger::new(pool);
    let records = ledger
        .history(user_id, query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await
        .map_err(|e| {
            error!(?e, "DB error listing generations");
            AppError::Message("Failed to list generations".into())
        })?;
    Ok(Json(records))
}
