use std::collections::HashMap;

use sqlx::{FromRow, PgConnection};

use crate::{
    engine::{
        cache::{CacheBlock, GeneratorCache, SegmentPool, merge_candidates},
        steps::question_meets_steps,
    },
    models::{
        question::{CandidateAnswer, CandidateQuestion, Question},
        template::{QuestionFormat, SegmentFilter, Template, TemplateBlock, TemplateSegment},
    },
};

#[derive(FromRow)]
struct AnswerRow {
    question_id: i64,
    #[sqlx(flatten)]
    answer: CandidateAnswer,
}

#[derive(FromRow)]
struct StepRow {
    question_id: i64,
    step_id: i64,
}

/// Builds the request-scoped candidate snapshot for a template.
///
/// Only active questions of the template's course and the block's format are
/// considered. Multiple-choice candidates must carry more answers than the
/// block asks for.
pub async fn load_generator_cache(
    conn: &mut PgConnection,
    template: &Template,
) -> Result<GeneratorCache, sqlx::Error> {
    let mut blocks = Vec::with_capacity(template.blocks.len());

    for block in &template.blocks {
        let mut segments = Vec::with_capacity(block.segments.len());
        for segment in &block.segments {
            let candidates = load_segment_candidates(conn, template.course_id, block, segment).await?;
            tracing::debug!(
                block = block.id,
                segment = segment.id,
                candidates = candidates.len(),
                "Segment pool loaded"
            );
            segments.push(SegmentPool::new(segment, candidates));
        }
        blocks.push(CacheBlock {
            block: block.clone(),
            segments,
        });
    }

    Ok(GeneratorCache::new(blocks))
}

async fn load_segment_candidates(
    conn: &mut PgConnection,
    course_id: i64,
    block: &TemplateBlock,
    segment: &TemplateSegment,
) -> Result<Vec<CandidateQuestion>, sqlx::Error> {
    let handpicked = match segment.filter_by {
        SegmentFilter::Q | SegmentFilter::Sqor => {
            sqlx::query_as::<_, Question>(
                r#"
                SELECT id, question_format, chapter_id, category_id, times_used
                FROM questions
                WHERE id = ANY($1) AND course_id = $2 AND active AND question_format = $3
                ORDER BY id
                "#,
            )
            .bind(&segment.questions)
            .bind(course_id)
            .bind(block.question_format)
            .fetch_all(&mut *conn)
            .await?
        }
        SegmentFilter::All | SegmentFilter::S => Vec::new(),
    };

    let mut filtered = match segment.filter_by {
        SegmentFilter::All | SegmentFilter::S | SegmentFilter::Sqor => {
            sqlx::query_as::<_, Question>(
                r#"
                SELECT id, question_format, chapter_id, category_id, times_used
                FROM questions
                WHERE course_id = $1
                  AND active
                  AND question_format = $2
                  AND ($3::BIGINT IS NULL OR chapter_id = $3)
                  AND ($3::BIGINT IS NULL OR $4::BIGINT IS NULL OR category_id = $4)
                ORDER BY id
                "#,
            )
            .bind(course_id)
            .bind(block.question_format)
            .bind(segment.chapter_id)
            .bind(segment.category_id)
            .fetch_all(&mut *conn)
            .await?
        }
        SegmentFilter::Q => Vec::new(),
    };

    if matches!(segment.filter_by, SegmentFilter::S | SegmentFilter::Sqor) {
        if let Some(mode) = segment.steps_mode {
            let ids: Vec<i64> = filtered.iter().map(|q| q.id).collect();
            let steps = load_question_steps(conn, &ids).await?;
            filtered.retain(|q| {
                let question_steps = steps.get(&q.id).map(Vec::as_slice).unwrap_or(&[]);
                question_meets_steps(question_steps, &segment.steps, mode)
            });
        }
    }

    let ids: Vec<i64> = handpicked.iter().chain(filtered.iter()).map(|q| q.id).collect();
    let mut answers = match block.question_format {
        QuestionFormat::Test => load_answers(conn, &ids).await?,
        QuestionFormat::Open => HashMap::new(),
    };

    let mut to_candidate = |q: &Question| {
        CandidateQuestion::from_question(q, answers.remove(&q.id).unwrap_or_default())
    };
    let handpicked: Vec<CandidateQuestion> = handpicked.iter().map(&mut to_candidate).collect();
    let filtered: Vec<CandidateQuestion> = filtered.iter().map(&mut to_candidate).collect();

    let mut candidates = merge_candidates(handpicked, filtered);
    if block.question_format == QuestionFormat::Test {
        let required = block.answer_count.max(0) as usize;
        candidates.retain(|c| c.answers.len() > required);
    }

    Ok(candidates)
}

async fn load_question_steps(
    conn: &mut PgConnection,
    question_ids: &[i64],
) -> Result<HashMap<i64, Vec<i64>>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StepRow>(
        "SELECT question_id, step_id FROM question_steps WHERE question_id = ANY($1)",
    )
    .bind(question_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut steps: HashMap<i64, Vec<i64>> = HashMap::new();
    for row in rows {
        steps.entry(row.question_id).or_default().push(row.step_id);
    }
    Ok(steps)
}

async fn load_answers(
    conn: &mut PgConnection,
    question_ids: &[i64],
) -> Result<HashMap<i64, Vec<CandidateAnswer>>, sqlx::Error> {
    let rows = sqlx::query_as::<_, AnswerRow>(
        "SELECT question_id, id, correct FROM answers WHERE question_id = ANY($1) ORDER BY id",
    )
    .bind(question_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut answers: HashMap<i64, Vec<CandidateAnswer>> = HashMap::new();
    for row in rows {
        answers.entry(row.question_id).or_default().push(row.answer);
    }
    Ok(answers)
}

/// Adds each question's appearance count in a persisted batch to its usage counter.
pub async fn bump_usage(
    conn: &mut PgConnection,
    counts: &HashMap<i64, i32>,
) -> Result<(), sqlx::Error> {
    if counts.is_empty() {
        return Ok(());
    }
    let (ids, increments): (Vec<i64>, Vec<i32>) = counts.iter().map(|(id, n)| (*id, *n)).unzip();

    sqlx::query(
        r#"
        UPDATE questions q
        SET times_used = q.times_used + u.increment
        FROM UNNEST($1::BIGINT[], $2::INTEGER[]) AS u(id, increment)
        WHERE q.id = u.id
        "#,
    )
    .bind(&ids)
    .bind(&increments)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
