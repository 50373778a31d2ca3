// src/models/instance.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use super::template::QuestionFormat;

/// Lifecycle state of a test instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_state", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Ready,
    Active,
    Finished,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_form", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceForm {
    Online,
    Offline,
}

/// Represents the 'test_instances' table.
/// Binds one test to one participant, term and course item.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TestInstance {
    pub id: i64,
    pub test_id: i64,
    pub participant_id: i64,
    pub term_id: i64,
    pub course_item_id: i64,

    /// Stored state. Use `lifecycle::effective_state` for reads that care about expiry.
    pub state: InstanceState,
    pub form: InstanceForm,
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Tutor-assigned, added on top of the computed score.
    pub bonus_points: f64,
    pub bonus_points_reason: String,
    pub created_at: DateTime<Utc>,
}

/// One answer row of an instance question, joined with its correctness.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstanceAnswer {
    pub id: i64,
    pub instance_question_id: i64,
    pub correct: bool,
    pub order: i32,
    pub selected: bool,
}

/// Represents the 'test_instance_questions' table (per-question response state),
/// joined with the generated test question it answers.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstanceQuestion {
    pub id: i64,
    pub block_id: i64,
    pub question_format: QuestionFormat,
    pub order: i32,
    pub text_answer: Option<String>,

    /// Presence marks an open question as graded.
    pub reviewed_by_id: Option<i64>,
    pub percentage: f64,

    #[sqlx(skip)]
    pub answers: Vec<InstanceAnswer>,
}

/// Audit event types written by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_event_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    TestStart,
    QuestionUpdate,
    InvalidIp,
    BonusPoints,
}

/// Represents the 'test_instance_events' table.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceEvent {
    pub instance_id: i64,
    pub user_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub event_data: serde_json::Value,
}

/// A single selection change for a picked answer.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnswerSelection {
    /// Instance answer id.
    pub id: i64,
    pub selected: bool,
}

/// Response payload for one instance question.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QuestionResponse {
    /// Instance question id.
    pub id: i64,

    #[validate(length(max = 20000))]
    pub text_answer: Option<String>,

    /// Reviewer only.
    #[validate(range(min = 0.0, max = 100.0))]
    pub text_answer_percentage: Option<f64>,

    /// Reviewer only.
    pub text_answer_reviewed: Option<bool>,

    #[serde(default)]
    pub answers: Vec<AnswerSelection>,
}

/// DTO for creating an instance from an existing test.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateInstanceRequest {
    #[validate(range(min = 1))]
    pub participant_id: i64,
    #[validate(range(min = 1))]
    pub term_id: i64,
    pub form: InstanceForm,
}

/// DTO for participant finish.
#[derive(Debug, Deserialize, Validate)]
pub struct FinishInstanceRequest {
    #[validate(nested)]
    pub questions: Vec<QuestionResponse>,
}

/// DTO for the reviewer override.
#[derive(Debug, Deserialize, Validate)]
pub struct TutorFinishRequest {
    #[validate(nested)]
    pub questions: Vec<QuestionResponse>,
    #[serde(default)]
    pub bonus_points: f64,
    #[serde(default)]
    #[validate(length(max = 1000))]
    pub bonus_points_reason: String,
}

/// Returned by the start endpoint.
#[derive(Debug, Serialize)]
pub struct StartInstanceResponse {
    pub instance_id: i64,
    pub ends_at: DateTime<Utc>,
}
