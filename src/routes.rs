use axum::{
    routing::{get, post},
    Router,
};

use crate::{auth, billing, generation, ledger};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/register", post(auth::register_user))
        .route("/api/login", post(auth::login_user))
        .route("/api/logout", post(auth::logout_user))
        .route("/api/me", get(auth::current_user))
        .route("/api/tier", post(auth::set_tier))
        .route("/api/generate", post(generation::generate))
        .route("/api/demo/generate", post(generation::demo_generate))
        .route("/api/generations", get(ledger::list_generations))
        .route("/api/checkout", post(billing::create_checkout))
        .route("/api/webhooks/billing", post(billing::billing_webhook))
}
