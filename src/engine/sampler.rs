use std::collections::{HashMap, HashSet};

use chrono::Utc;
use rand::{Rng, seq::SliceRandom};

use crate::{
    engine::{answers::pick_answers, cache::GeneratorCache, error::EngineError},
    models::{
        question::CandidateQuestion,
        template::{QuestionFormat, Template},
        test::{GeneratedVariant, PickedQuestion, TestBlock},
    },
};

/// Who (or which group) a variant is generated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantTarget {
    pub name_for: String,
    pub group_label: String,
    pub participant_id: Option<i64>,
}

impl VariantTarget {
    /// The n-th shared variant of a batch, labelled A, B, ... Z, AA, ...
    pub fn labelled(index: usize) -> Self {
        let label = variant_label(index);
        Self {
            name_for: format!("variant{label}"),
            group_label: label,
            participant_id: None,
        }
    }

    /// An individualized variant for one participant.
    pub fn participant(participant_id: i64) -> Self {
        Self {
            name_for: format!("participant{participant_id}"),
            group_label: String::new(),
            participant_id: Some(participant_id),
        }
    }
}

/// Samples one variant from the cache.
///
/// Blocks are processed in declared order. Within a segment the candidates are
/// shuffled and then stably sorted by usage, so less used questions come first
/// and ties stay in random order. A question id is used at most once per variant.
pub fn generate_variant_questions<R: Rng + ?Sized>(
    cache: &GeneratorCache,
    mix_blocks: bool,
    mix_everything: bool,
    rng: &mut R,
) -> Result<Vec<PickedQuestion>, EngineError> {
    let mut used: HashSet<i64> = HashSet::new();
    let mut blocked: Vec<Vec<PickedQuestion>> = Vec::with_capacity(cache.blocks().len());
    let mut order: i32 = 1;

    for cache_block in cache.blocks() {
        let block = &cache_block.block;
        let mut block_questions: Vec<PickedQuestion> = Vec::new();

        for segment in &cache_block.segments {
            let mut pool: Vec<&CandidateQuestion> = segment.candidates.iter().collect();
            pool.shuffle(rng);
            pool.sort_by_key(|c| c.times_used);

            let mut picked = 0usize;
            for candidate in pool {
                if picked == segment.required {
                    break;
                }
                if used.contains(&candidate.id) {
                    continue;
                }

                let answers = match block.question_format {
                    QuestionFormat::Test => match pick_answers(
                        block.answer_count.max(0) as usize,
                        &candidate.answers,
                        block.answer_distribution,
                        rng,
                    ) {
                        Ok(answers) => answers,
                        Err(_) => continue,
                    },
                    QuestionFormat::Open => Vec::new(),
                };

                block_questions.push(PickedQuestion {
                    block_id: block.id,
                    question_id: candidate.id,
                    question_format: block.question_format,
                    order,
                    position: 0,
                    answers,
                });
                order += 1;
                picked += 1;
                used.insert(candidate.id);
            }

            if picked != segment.required {
                return Err(EngineError::InsufficientPool {
                    block: block.id,
                    segment: segment.segment_id,
                    required: segment.required,
                    picked,
                });
            }
        }

        if block.mix_inside_block {
            block_questions.shuffle(rng);
        }

        blocked.push(block_questions);
    }

    if mix_blocks {
        blocked.shuffle(rng);
    }

    let mut questions: Vec<PickedQuestion> = blocked.into_iter().flatten().collect();

    if mix_everything {
        questions.shuffle(rng);
    }

    for (i, question) in questions.iter_mut().enumerate() {
        question.position = i as i32 + 1;
    }

    Ok(questions)
}

/// Samples a variant, retrying from scratch up to `max_tries` times.
///
/// The template is validated first; an invalid template is never retried.
pub fn generate_variant<R: Rng + ?Sized>(
    template: &Template,
    cache: &GeneratorCache,
    max_tries: usize,
    rng: &mut R,
) -> Result<Vec<PickedQuestion>, EngineError> {
    template.validate()?;

    let max_tries = max_tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match generate_variant_questions(cache, template.mix_blocks, template.mix_everything, rng)
        {
            Ok(questions) => return Ok(questions),
            Err(err) if err.is_retryable() && attempt < max_tries => {
                tracing::warn!(
                    template_id = template.id,
                    attempt,
                    error = %err,
                    "Variant sampling failed, retrying"
                );
            }
            Err(err) => {
                return Err(EngineError::GenerationFailed {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
        }
    }
}

/// Generates one variant per target, sequentially, against the same cache.
///
/// Either every variant is produced or the first failure is returned, so the
/// caller never persists a partial batch.
pub fn generate_batch<R: Rng + ?Sized>(
    template: &Template,
    cache: &GeneratorCache,
    targets: &[VariantTarget],
    max_tries: usize,
    rng: &mut R,
) -> Result<Vec<GeneratedVariant>, EngineError> {
    let blocks = block_snapshot(template);
    let mut variants = Vec::with_capacity(targets.len());

    for target in targets {
        let questions = generate_variant(template, cache, max_tries, rng)?;
        variants.push(GeneratedVariant {
            name: format!("{}-{}", target.name_for, Utc::now().timestamp_micros()),
            group_label: target.group_label.clone(),
            participant_id: target.participant_id,
            blocks: blocks.clone(),
            questions,
        });
    }

    Ok(variants)
}

/// Freezes the template's block metadata for a generated test.
pub fn block_snapshot(template: &Template) -> Vec<TestBlock> {
    template.blocks.iter().map(TestBlock::from).collect()
}

/// Spreadsheet-style label for the n-th variant (0 -> "A", 26 -> "AA").
pub fn variant_label(n: usize) -> String {
    let mut label = Vec::new();
    let mut n = n as i64;
    while n >= 0 {
        label.push(b'A' + (n % 26) as u8);
        n = n / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

/// How many times each question appears across a batch.
pub fn usage_counts(variants: &[GeneratedVariant]) -> HashMap<i64, i32> {
    let mut counts = HashMap::new();
    for question in variants.iter().flat_map(|v| v.questions.iter()) {
        *counts.entry(question.question_id).or_insert(0) += 1;
    }
    counts
}
