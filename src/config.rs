// src/config.rs

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use dotenvy::dotenv;
use thiserror::Error;

use crate::engine::scoring::{ClampMode, ScoringPolicy, WrongAnswerMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub listen_addr: SocketAddr,

    /// Per-variant retry budget.
    pub generation_max_tries: usize,

    /// Rows per INSERT when persisting a generated batch.
    pub generation_batch_size: usize,
    pub scoring: ScoringPolicy,

    /// None disables the expiry sweeper.
    pub sweep_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let listen_addr: SocketAddr = parse_or(&lookup, "LISTEN_ADDR", "0.0.0.0:3000")?;
        let generation_max_tries: usize = parse_or(&lookup, "GENERATION_MAX_TRIES", "3")?;
        let generation_batch_size: usize = parse_or(&lookup, "GENERATION_BATCH_SIZE", "50")?;
        let wrong_answers: WrongAnswerMode = parse_or(&lookup, "WRONG_ANSWER_MODE", "full")?;
        let clamp: ClampMode = parse_or(&lookup, "SCORE_CLAMP", "none")?;
        let sweep_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", "60")?;

        if generation_max_tries == 0 {
            return Err(ConfigError::Invalid {
                name: "GENERATION_MAX_TRIES",
                value: "0".to_string(),
            });
        }
        if generation_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "GENERATION_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            jwt_secret,
            rust_log,
            listen_addr,
            generation_max_tries,
            generation_batch_size,
            scoring: ScoringPolicy {
                wrong_answers,
                clamp,
            },
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}
