// src/models/template.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::error::EngineError;

/// Format of every question inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "question_format", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionFormat {
    /// Free-text answer, graded manually as a percentage.
    Open,
    /// Multiple choice with a picked answer subset.
    Test,
}

/// How many correct vs. incorrect answers a picked subset must contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "answer_distribution", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnswerDistribution {
    ExactlyOneCorrect,
    MinimumOneCorrect,
    MinimumOneCorrectOneIncorrect,
}

/// Where a segment takes its candidates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "segment_filter", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentFilter {
    /// Everything in the chapter (and category, when set).
    All,
    /// Hand-picked question list.
    Q,
    /// Chapter/category narrowed by step selection.
    S,
    /// Hand-picked list plus step-filtered questions.
    Sqor,
}

/// Step matching rule used by `SegmentFilter::S` and `SegmentFilter::Sqor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_selection", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepSelection {
    /// Exactly the selected steps, nothing else.
    Nc,
    /// Only selected steps, at least one of them.
    Nd,
    /// All selected steps, others allowed.
    Sc,
    /// At least one selected step, others allowed.
    Sd,
}

/// Represents the 'templates' table: a reusable exam blueprint.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub course_id: i64,
    pub title: String,

    /// Shuffle the order of blocks per variant.
    pub mix_blocks: bool,

    /// Shuffle the final question list, ignoring block boundaries.
    pub mix_everything: bool,

    #[sqlx(skip)]
    pub blocks: Vec<TemplateBlock>,
}

/// Represents the 'template_blocks' table: a weighted, scored section.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TemplateBlock {
    pub id: i64,
    pub title: String,
    pub show_name: bool,

    /// Descriptive only, the sampler does not enforce it.
    pub difficulty_from: i32,
    pub difficulty_to: i32,

    /// Percentage of the course item's maximum points.
    pub weight: i32,
    pub question_format: QuestionFormat,
    pub question_count: i32,
    pub answer_count: i32,
    pub answer_distribution: AnswerDistribution,
    pub wrong_answer_percentage: i32,
    pub allow_empty_answers: bool,
    pub mix_inside_block: bool,

    #[sqlx(skip)]
    pub segments: Vec<TemplateSegment>,
}

/// Represents the 'template_block_segments' table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TemplateSegment {
    pub id: i64,
    pub chapter_id: Option<i64>,
    pub category_id: Option<i64>,
    pub question_count: i32,
    pub filter_by: SegmentFilter,
    pub steps_mode: Option<StepSelection>,

    /// Step ids from 'segment_steps'.
    #[sqlx(skip)]
    pub steps: Vec<i64>,

    /// Hand-picked question ids from 'segment_questions'.
    #[sqlx(skip)]
    pub questions: Vec<i64>,
}

impl Template {
    /// Checks the structural invariants the sampler relies on:
    /// block weights sum to 100 and every block's segments supply exactly
    /// its required question count.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.blocks.is_empty() {
            return Err(EngineError::InvalidTemplate(
                "template has no blocks".to_string(),
            ));
        }

        let weight_sum: i64 = self.blocks.iter().map(|b| i64::from(b.weight)).sum();
        if weight_sum != 100 {
            return Err(EngineError::InvalidTemplate(format!(
                "block weights sum to {weight_sum}, expected 100"
            )));
        }

        for block in &self.blocks {
            block.validate()?;
        }

        Ok(())
    }
}

impl TemplateBlock {
    fn validate(&self) -> Result<(), EngineError> {
        if self.weight < 0 || self.question_count < 0 || self.answer_count < 0 {
            return Err(EngineError::InvalidTemplate(format!(
                "block {} has a negative weight or count",
                self.id
            )));
        }

        let segment_sum: i64 = self
            .segments
            .iter()
            .map(|s| i64::from(s.question_count))
            .sum();
        if segment_sum != i64::from(self.question_count) {
            return Err(EngineError::InvalidTemplate(format!(
                "block {} segments supply {} questions, block requires {}",
                self.id, segment_sum, self.question_count
            )));
        }

        if self.segments.iter().any(|s| s.question_count < 0) {
            return Err(EngineError::InvalidTemplate(format!(
                "block {} has a segment with a negative question count",
                self.id
            )));
        }

        if self.question_format == QuestionFormat::Test && self.answer_count == 0 {
            return Err(EngineError::InvalidTemplate(format!(
                "block {} is multiple choice but requires no answers",
                self.id
            )));
        }

        Ok(())
    }
}
