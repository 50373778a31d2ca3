// src/state.rs

use axum::extract::FromRef;
use sqlx::PgPool;

use crate::{config::Config, engine::scoring::ScoringPolicy};

/// Shared handler state. Cloned per request; both fields are cheap handles.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for ScoringPolicy {
    fn from_ref(state: &AppState) -> Self {
        state.config.scoring
    }
}
