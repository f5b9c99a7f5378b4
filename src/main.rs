use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use copydesk::billing::PaymentClient;
use copydesk::config::AppConfig;
use copydesk::generation::{GenerationApi, GenerationClient};
use copydesk::routes::api_routes;

async fn root() -> &'static str {
    "Copydesk API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fails fast if JWT_SECRET, BILLING_WEBHOOK_SECRET or GENERATION_API_KEY
    // are missing.
    let config = Arc::new(AppConfig::from_env());

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if config.allow_migration_failure {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let gateway: Arc<dyn GenerationApi> = Arc::new(GenerationClient::new(&config));
    let payment: Option<Arc<PaymentClient>> = PaymentClient::from_config(&config).map(Arc::new);
    if payment.is_none() {
        tracing::warn!("PAYMENT_API_KEY not set; checkout is disabled");
    }
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(config.clone()))
        .layer(Extension(gateway.clone()))
        .layer(Extension(payment.clone()));

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
