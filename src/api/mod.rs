//! HTTP surface: run trigger, data queries, run history, health, metrics.

pub mod routes;

pub use routes::{create_router, AppState};
