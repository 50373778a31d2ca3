//! Point computation for finished instances.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    engine::{error::EngineError, lifecycle::effective_state},
    models::{
        instance::{InstanceQuestion, InstanceState, TestInstance},
        result::{EvaluateBy, ItemResult},
        template::QuestionFormat,
        test::TestBlock,
    },
};

/// How much a wrong multiple-choice answer costs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WrongAnswerMode {
    /// A mismatch costs exactly as much as a match earns.
    #[default]
    Full,
    /// A mismatch costs the block's `wrong_answer_percentage` of a match.
    BlockWeighted,
}

/// Where negative totals are cut off at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClampMode {
    #[default]
    None,
    PerBlock,
    /// Applied to the sum before bonus points.
    PerInstance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringPolicy {
    pub wrong_answers: WrongAnswerMode,
    pub clamp: ClampMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognised mode '{}'", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for WrongAnswerMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "block" => Ok(Self::BlockWeighted),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

impl FromStr for ClampMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "block" => Ok(Self::PerBlock),
            "instance" => Ok(Self::PerInstance),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Points earned in one block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockScore {
    pub block_id: i64,
    pub allocated: f64,
    pub points: f64,
    pub questions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// Rounded to two decimals, bonus included.
    pub points: f64,

    /// False while any open question is unreviewed.
    pub is_final: bool,
    pub blocks: Vec<BlockScore>,
}

/// Rounds half to even at two decimals.
pub fn round_points(points: f64) -> f64 {
    (points * 100.0).round_ties_even() / 100.0
}

/// Scores a finished or expired instance.
///
/// Each block gets `points_max * weight / 100`, split evenly over its
/// questions. Questions whose block is not in `blocks` are ignored.
pub fn evaluate(
    instance: &TestInstance,
    blocks: &[TestBlock],
    questions: &[InstanceQuestion],
    points_max: f64,
    policy: ScoringPolicy,
    now: DateTime<Utc>,
) -> Result<Evaluation, EngineError> {
    match effective_state(instance, now) {
        InstanceState::Finished | InstanceState::Expired => {}
        InstanceState::Ready | InstanceState::Active => {
            return Err(EngineError::CannotEvaluateActive);
        }
    }

    let mut is_final = true;
    let mut scores = Vec::with_capacity(blocks.len());

    for block in blocks {
        let block_questions: Vec<&InstanceQuestion> =
            questions.iter().filter(|q| q.block_id == block.id).collect();
        let allocated = points_max * f64::from(block.weight) / 100.0;

        let mut points = 0.0;
        if !block_questions.is_empty() {
            let per_question = allocated / block_questions.len() as f64;
            for question in &block_questions {
                points += match question.question_format {
                    QuestionFormat::Open => {
                        if question.reviewed_by_id.is_none() {
                            is_final = false;
                        }
                        question.percentage / 100.0 * per_question
                    }
                    QuestionFormat::Test => {
                        score_choice_question(question, block, per_question, policy.wrong_answers)
                    }
                };
            }
        }

        if policy.clamp == ClampMode::PerBlock {
            points = points.max(0.0);
        }

        scores.push(BlockScore {
            block_id: block.id,
            allocated,
            points,
            questions: block_questions.len(),
        });
    }

    let mut total: f64 = scores.iter().map(|s| s.points).sum();
    if policy.clamp == ClampMode::PerInstance {
        total = total.max(0.0);
    }
    total += instance.bonus_points;

    Ok(Evaluation {
        points: round_points(total),
        is_final,
        blocks: scores,
    })
}

fn score_choice_question(
    question: &InstanceQuestion,
    block: &TestBlock,
    per_question: f64,
    mode: WrongAnswerMode,
) -> f64 {
    let count = question.answers.len();
    if count == 0 {
        return 0.0;
    }

    if block.allow_empty_answers {
        let selected = question.answers.iter().filter(|a| a.selected).count();
        if selected == 0 || selected == count {
            return 0.0;
        }
    }

    let per_answer = per_question / count as f64;
    let penalty = match mode {
        WrongAnswerMode::Full => per_answer,
        WrongAnswerMode::BlockWeighted => {
            per_answer * f64::from(block.wrong_answer_percentage) / 100.0
        }
    };

    question
        .answers
        .iter()
        .map(|a| if a.selected == a.correct { per_answer } else { -penalty })
        .sum()
}

/// Writes an evaluation into its result row. `updated_by` is None for unattended runs.
pub fn apply_evaluation(result: &mut ItemResult, evaluation: &Evaluation, updated_by: Option<i64>) {
    result.points = evaluation.points;
    result.is_final = evaluation.is_final;
    result.version += 1;
    result.updated_by_id = updated_by;
}

/// Picks the result that counts for a course item among a participant's
/// results. Only final results are considered.
pub fn select_result(results: &[ItemResult], by: EvaluateBy) -> Option<i64> {
    let finals = results.iter().filter(|r| r.is_final);
    let chosen = match by {
        EvaluateBy::Best => finals.max_by(|a, b| {
            a.points
                .total_cmp(&b.points)
                .then_with(|| a.created_at.cmp(&b.created_at))
        }),
        EvaluateBy::Last => finals.max_by_key(|r| (r.created_at, r.id)),
    };
    chosen.map(|r| r.id)
}
