// src/models/question.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::template::QuestionFormat;

/// Represents the 'questions' table as seen by the generator.
/// Content lives with the external question bank; only sampling data is read here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub question_format: QuestionFormat,
    pub chapter_id: Option<i64>,
    pub category_id: Option<i64>,

    /// How many generated variants already used this question.
    pub times_used: i32,
}

/// Represents the 'answers' table (correctness only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CandidateAnswer {
    pub id: i64,
    pub correct: bool,
}

/// A question eligible for one segment, with everything the sampler needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateQuestion {
    pub id: i64,
    pub times_used: i32,
    pub question_format: QuestionFormat,
    pub answers: Vec<CandidateAnswer>,
}

impl CandidateQuestion {
    pub fn from_question(question: &Question, answers: Vec<CandidateAnswer>) -> Self {
        Self {
            id: question.id,
            times_used: question.times_used,
            question_format: question.question_format,
            answers,
        }
    }
}
