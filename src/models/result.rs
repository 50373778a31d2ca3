// src/models/result.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::scoring::BlockScore;

/// Which result counts when a participant has several attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "evaluate_by", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluateBy {
    Best,
    Last,
}

/// Represents the 'course_item_results' table.
/// Stores the computed point outcome of a test instance.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: i64,
    pub student_id: i64,
    pub course_item_id: i64,
    pub term_id: i64,
    pub test_instance_id: Option<i64>,

    /// Unclamped unless the scoring policy says otherwise.
    pub points: f64,

    /// False while any open question is still waiting for review.
    pub is_final: bool,

    /// Marks the result that counts for the course item.
    pub selected: bool,

    /// Incremented on every evaluation.
    pub version: i32,

    /// None when computed by an unattended evaluation.
    pub updated_by_id: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Returned by finish, review and evaluate.
#[derive(Debug, Serialize)]
pub struct EvaluationResponse {
    pub result: ItemResult,

    /// Per-block breakdown of the points.
    pub blocks: Vec<BlockScore>,
}
