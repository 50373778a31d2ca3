// src/models/course_item.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::result::EvaluateBy;

/// Represents the 'course_items' table, reduced to the test settings the engine reads.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CourseItem {
    pub id: i64,
    pub course_id: i64,
    pub parent_id: Option<i64>,
    pub created_by_id: i64,
    pub template_id: Option<i64>,
    pub points_max: f64,
    pub time_limit_minutes: i32,

    /// `;`-separated addresses or `start-end` ranges. Empty allows everyone.
    pub ip_ranges: String,

    /// Instances a participant may have for this item. A parent group's value caps it.
    pub max_attempts: i32,
    pub evaluate_by: EvaluateBy,
}

/// Represents the 'terms' table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Term {
    pub id: i64,
    pub course_item_id: i64,
    pub active_from: DateTime<Utc>,
    pub active_to: DateTime<Utc>,

    /// Instances a participant may have within this term.
    pub tries: i32,

    /// Maximum joined students. None means unlimited.
    pub student_limit: Option<i32>,
}
