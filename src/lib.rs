pub mod auth;
pub mod billing;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod ledger;
pub mod routes;
