use thiserror::Error;

use crate::models::instance::InstanceState;

/// Failures raised by the sampling, lifecycle and scoring algorithms.
///
/// Nothing here touches storage; persistence failures surface as
/// `sqlx::Error` through `AppError` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error(
        "not enough questions in question pool for block {block} segment {segment} \
         (required {required}, picked {picked})"
    )]
    InsufficientPool {
        block: i64,
        segment: i64,
        required: usize,
        picked: usize,
    },

    #[error("not enough answers to pick {required} from")]
    NotEnoughAnswers { required: usize },

    #[error("failed to generate test variant after {attempts} attempts: {source}")]
    GenerationFailed {
        attempts: usize,
        #[source]
        source: Box<EngineError>,
    },

    #[error("instance is {actual:?}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: InstanceState,
    },

    #[error("instance is not set as online")]
    NotOnline,

    #[error("another test instance is already running")]
    AnotherInstanceActive,

    #[error("time expired")]
    TimeExpired,

    #[error("address {address} is not in range of allowed addresses")]
    NetworkDenied { address: String },

    #[error("participant has not joined term {term_id}")]
    NotJoined { term_id: i64 },

    #[error("participant {participant_id} has no attempts left")]
    NoAttemptsLeft { participant_id: i64 },

    #[error("instance does not belong to the requesting participant")]
    NotOwner,

    #[error("cannot evaluate active instance")]
    CannotEvaluateActive,

    #[error("question {0} is not part of this instance")]
    UnknownQuestion(i64),

    #[error("answer {0} is not part of this question")]
    UnknownAnswer(i64),

    #[error("reviewed percentage {0} is outside 0..=100")]
    InvalidPercentage(f64),

    #[error("participants cannot review their own answers")]
    ReviewNotAllowed,
}

impl EngineError {
    /// Whether a fresh sampling attempt could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientPool { .. } | EngineError::NotEnoughAnswers { .. }
        )
    }
}
