use std::collections::HashMap;

use sqlx::{FromRow, PgConnection};

use crate::models::template::{Template, TemplateBlock, TemplateSegment};

#[derive(FromRow)]
struct BlockRow {
    template_id: i64,
    #[sqlx(flatten)]
    block: TemplateBlock,
}

#[derive(FromRow)]
struct SegmentRow {
    block_id: i64,
    #[sqlx(flatten)]
    segment: TemplateSegment,
}

/// (segment id, linked id) pairs from the segment link tables.
#[derive(FromRow)]
struct SegmentLink {
    segment_id: i64,
    linked_id: i64,
}

/// Loads a template with its blocks, segments, step selections and hand-picked questions.
pub async fn find_template(
    conn: &mut PgConnection,
    template_id: i64,
) -> Result<Option<Template>, sqlx::Error> {
    let template = sqlx::query_as::<_, Template>(
        "SELECT id, course_id, title, mix_blocks, mix_everything FROM templates WHERE id = $1",
    )
    .bind(template_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut template) = template else {
        return Ok(None);
    };

    let blocks = sqlx::query_as::<_, BlockRow>(
        r#"
        SELECT
            template_id, id, title, show_name, difficulty_from, difficulty_to, weight,
            question_format, question_count, answer_count, answer_distribution,
            wrong_answer_percentage, allow_empty_answers, mix_inside_block
        FROM template_blocks
        WHERE template_id = $1
        ORDER BY position, id
        "#,
    )
    .bind(template_id)
    .fetch_all(&mut *conn)
    .await?;

    let block_ids: Vec<i64> = blocks.iter().map(|b| b.block.id).collect();

    let segments = sqlx::query_as::<_, SegmentRow>(
        r#"
        SELECT block_id, id, chapter_id, category_id, question_count, filter_by, steps_mode
        FROM template_block_segments
        WHERE block_id = ANY($1)
        ORDER BY position, id
        "#,
    )
    .bind(&block_ids)
    .fetch_all(&mut *conn)
    .await?;

    let segment_ids: Vec<i64> = segments.iter().map(|s| s.segment.id).collect();

    let steps = sqlx::query_as::<_, SegmentLink>(
        "SELECT segment_id, step_id AS linked_id FROM segment_steps WHERE segment_id = ANY($1)",
    )
    .bind(&segment_ids)
    .fetch_all(&mut *conn)
    .await?;

    let handpicked = sqlx::query_as::<_, SegmentLink>(
        "SELECT segment_id, question_id AS linked_id FROM segment_questions WHERE segment_id = ANY($1)",
    )
    .bind(&segment_ids)
    .fetch_all(&mut *conn)
    .await?;

    let mut steps_by_segment: HashMap<i64, Vec<i64>> = HashMap::new();
    for link in steps {
        steps_by_segment.entry(link.segment_id).or_default().push(link.linked_id);
    }
    let mut questions_by_segment: HashMap<i64, Vec<i64>> = HashMap::new();
    for link in handpicked {
        questions_by_segment
            .entry(link.segment_id)
            .or_default()
            .push(link.linked_id);
    }

    let mut segments_by_block: HashMap<i64, Vec<TemplateSegment>> = HashMap::new();
    for row in segments {
        let mut segment = row.segment;
        segment.steps = steps_by_segment.remove(&segment.id).unwrap_or_default();
        segment.questions = questions_by_segment.remove(&segment.id).unwrap_or_default();
        segments_by_block.entry(row.block_id).or_default().push(segment);
    }

    template.blocks = blocks
        .into_iter()
        .filter(|row| row.template_id == template.id)
        .map(|row| {
            let mut block = row.block;
            block.segments = segments_by_block.remove(&block.id).unwrap_or_default();
            block
        })
        .collect();

    Ok(Some(template))
}
