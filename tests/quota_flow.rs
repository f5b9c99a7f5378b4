use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Extension, Json};
use serde_json::Value;
use sqlx::PgPool;

use copydesk::config::AppConfig;
use copydesk::entitlement::{QuotaPlan, Tier};
use copydesk::error::{AppError, AppResult};
use copydesk::extractor::AuthUser;
use copydesk::generation::{self, DemoGenerateRequest, GenerateRequest, GenerationApi};
use copydesk::ledger::UsageLedger;

// key: quota-tests -> admission,charging,history

fn test_config() -> Arc<AppConfig> {
    Arc::new(AppConfig {
        database_url: String::new(),
        bind_address: "127.0.0.1".into(),
        bind_port: 0,
        allow_migration_failure: false,
        jwt_secret: "secret".into(),
        billing_webhook_secret: "whsec".into(),
        generation_api_base: String::new(),
        generation_api_key: String::new(),
        generation_model: String::new(),
        generation_timeout: Duration::from_secs(1),
        payment_api_base: String::new(),
        payment_api_key: None,
        checkout_success_url: String::new(),
        checkout_cancel_url: String::new(),
        quota: QuotaPlan {
            free: 20_000,
            pro: 200_000,
            premium: 1_000_000,
        },
    })
}

struct StubGateway {
    response: Result<String, String>,
}

#[async_trait]
impl GenerationApi for StubGateway {
    async fn complete(&self, _messages: Value, _max_output_units: i64) -> AppResult<String> {
        match &self.response {
            Ok(content) => Ok(content.clone()),
            Err(message) => Err(AppError::Upstream(message.clone())),
        }
    }
}

fn gateway_ok(content: &str) -> Arc<dyn GenerationApi> {
    Arc::new(StubGateway {
        response: Ok(content.to_string()),
    })
}

fn gateway_failing() -> Arc<dyn GenerationApi> {
    Arc::new(StubGateway {
        response: Err("generation request failed".to_string()),
    })
}

async fn insert_user(pool: &PgPool, email: &str, tier: &str, used_quota: i64) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO users (email, password_hash, tier, used_quota) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(email)
    .bind("hashed")
    .bind(tier)
    .bind(used_quota)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn usage(pool: &PgPool, user_id: i32) -> i64 {
    sqlx::query_scalar("SELECT used_quota FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn history_count(pool: &PgPool, user_id: i32) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM generations WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn auth(user_id: i32) -> AuthUser {
    AuthUser {
        user_id,
        email: "writer@example.com".into(),
        role: "user".into(),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn successful_generation_charges_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 0).await;

    let Json(response) = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_ok("Coffee at Dawn\n\nA slow morning ritual.")),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(2_390),
        }),
    )
    .await
    .unwrap();

    assert_eq!(response.title, "Coffee at Dawn");
    assert!(response.cost > 2_390, "cost includes the prompt-side estimate");
    assert_eq!(usage(&pool, user_id).await, response.cost);
    assert_eq!(response.used_quota, response.cost);
    assert_eq!(history_count(&pool, user_id).await, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn denied_generation_is_a_noop(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 2_400).await;

    let result = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_ok("should never be reached")),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(18_000),
        }),
    )
    .await;

    match result {
        Err(AppError::QuotaExceeded { used, ceiling }) => {
            assert_eq!(used, 2_400);
            assert_eq!(ceiling, 20_000);
        }
        other => panic!("expected quota denial, got {other:?}"),
    }
    assert_eq!(usage(&pool, user_id).await, 2_400);
    assert_eq!(history_count(&pool, user_id).await, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn gateway_failure_never_charges(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 100).await;

    let result = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_failing()),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(500),
        }),
    )
    .await;

    assert!(matches!(result, Err(AppError::Upstream(_))));
    assert_eq!(usage(&pool, user_id).await, 100);
    assert_eq!(history_count(&pool, user_id).await, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn oversized_output_budget_rejected_without_charge(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 0).await;

    // A huge caller-supplied budget must bounce at validation, never reach
    // the cost arithmetic or the gateway.
    let result = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_ok("should never be reached")),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(i64::MAX),
        }),
    )
    .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert_eq!(usage(&pool, user_id).await, 0);
    assert_eq!(history_count(&pool, user_id).await, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn demo_generation_bypasses_metering_and_history(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 0).await;

    let Json(response) = generation::demo_generate(
        Extension(gateway_ok("Quick Note\n\nHello there.")),
        Json(DemoGenerateRequest {
            prompt: "say hello".into(),
        }),
    )
    .await
    .unwrap();

    assert_eq!(response.title, "Quick Note");
    // The demo path never touches the ledger: no charge, no history row.
    assert_eq!(usage(&pool, user_id).await, 0);
    let total_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM generations")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total_rows, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn premium_upgrade_admits_previously_denied_cost(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "free", 2_400).await;

    sqlx::query("UPDATE users SET tier = 'premium' WHERE id = $1")
        .bind(user_id)
        .execute(&pool)
        .await
        .unwrap();

    let Json(response) = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_ok("Roasting Basics\n\nStart light.")),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(18_000),
        }),
    )
    .await
    .unwrap();

    assert_eq!(response.quota_ceiling, 1_000_000);
    assert_eq!(usage(&pool, user_id).await, 2_400 + response.cost);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_stored_tier_meters_against_free_ceiling(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "platinum", 0).await;
    assert_eq!(Tier::from_db("platinum"), Tier::Free);

    let result = generation::generate(
        Extension(pool.clone()),
        Extension(test_config()),
        Extension(gateway_ok("unused")),
        auth(user_id),
        Json(GenerateRequest {
            topic: "coffee".into(),
            max_output_units: Some(25_000),
        }),
    )
    .await;

    match result {
        Err(AppError::QuotaExceeded { ceiling, .. }) => assert_eq!(ceiling, 20_000),
        other => panic!("expected free-ceiling denial, got {other:?}"),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn history_is_newest_first_and_bounded(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let user_id = insert_user(&pool, "writer@example.com", "pro", 0).await;

    let ledger = UsageLedger::new(pool.clone());
    for n in 0..5 {
        ledger
            .charge_and_record(user_id, 10, &format!("topic-{n}"), "content")
            .await
            .unwrap();
    }

    let records = ledger.history(user_id, 3).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].topic, "topic-4");
    assert_eq!(records[2].topic, "topic-2");
    assert_eq!(usage(&pool, user_id).await, 50);
}
