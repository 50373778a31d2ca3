// src/models/test.rs

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use validator::{Validate, ValidationError};

use super::{
    instance::InstanceForm,
    template::{QuestionFormat, TemplateBlock},
};

/// Snapshot of a template block frozen into a generated test.
/// Stored as JSONB so later template edits do not change old variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestBlock {
    pub id: i64,
    pub title: String,
    pub show_name: bool,
    pub weight: i32,
    pub question_format: QuestionFormat,
    pub wrong_answer_percentage: i32,
    pub allow_empty_answers: bool,
}

impl From<&TemplateBlock> for TestBlock {
    fn from(block: &TemplateBlock) -> Self {
        Self {
            id: block.id,
            title: block.title.clone(),
            show_name: block.show_name,
            weight: block.weight,
            question_format: block.question_format,
            wrong_answer_percentage: block.wrong_answer_percentage,
            allow_empty_answers: block.allow_empty_answers,
        }
    }
}

/// Represents the 'tests' table: one immutable generated variant.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Test {
    pub id: i64,
    pub course_id: i64,
    pub course_item_id: i64,
    pub term_id: i64,
    pub created_by_id: i64,
    pub name: String,

    /// Variant label ("A", "B", ...); empty for per-participant variants.
    pub group_label: String,
    pub blocks: Json<Vec<TestBlock>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// An answer picked into a multiple-choice question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickedAnswer {
    pub answer_id: i64,
    pub correct: bool,

    /// 1-based position inside the question.
    pub order: i32,
}

/// A question picked into a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickedQuestion {
    pub block_id: i64,
    pub question_id: i64,
    pub question_format: QuestionFormat,

    /// Pick order, assigned while sampling. Kept for audit.
    pub order: i32,

    /// Final display position after all shuffles.
    pub position: i32,

    /// Empty for open questions.
    pub answers: Vec<PickedAnswer>,
}

/// A variant produced by the sampler that has not been persisted yet.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedVariant {
    pub name: String,
    pub group_label: String,

    /// Set when the variant was generated for a specific participant.
    pub participant_id: Option<i64>,
    pub blocks: Vec<TestBlock>,
    pub questions: Vec<PickedQuestion>,
}

/// DTO for batch generation: either `count` shared variants or one variant per participant.
#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_generate_target"))]
pub struct GenerateRequest {
    #[validate(range(min = 1, max = 500))]
    pub count: Option<u32>,

    #[validate(length(min = 1, max = 2000))]
    pub participants: Option<Vec<i64>>,

    /// Form of the instances created for `participants`.
    #[serde(default = "default_form")]
    pub form: InstanceForm,
}

fn default_form() -> InstanceForm {
    InstanceForm::Online
}

fn validate_generate_target(req: &GenerateRequest) -> Result<(), ValidationError> {
    match (&req.count, &req.participants) {
        (Some(_), None) => Ok(()),
        (None, Some(participants)) => {
            let mut seen = HashSet::with_capacity(participants.len());
            if participants.iter().all(|id| seen.insert(*id)) {
                Ok(())
            } else {
                Err(ValidationError::new("duplicate_participant"))
            }
        }
        _ => Err(ValidationError::new("exactly_one_of_count_or_participants")),
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub test_ids: Vec<i64>,

    /// Ready instances created for per-participant generation.
    pub instance_ids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(count: Option<u32>, participants: Option<Vec<i64>>) -> GenerateRequest {
        GenerateRequest {
            count,
            participants,
            form: InstanceForm::Online,
        }
    }

    #[test]
    fn test_generate_target_is_exclusive() {
        assert!(request(Some(3), None).validate().is_ok());
        assert!(request(None, Some(vec![4, 5])).validate().is_ok());
        assert!(request(Some(3), Some(vec![4])).validate().is_err());
        assert!(request(None, None).validate().is_err());
    }

    #[test]
    fn test_duplicate_participants_rejected() {
        assert!(request(None, Some(vec![4, 5, 4])).validate().is_err());
    }
}
