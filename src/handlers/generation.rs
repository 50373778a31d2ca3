// src/handlers/generation.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use rand::{SeedableRng, rngs::StdRng};
use validator::Validate;

use crate::{
    engine::sampler::{VariantTarget, generate_batch, usage_counts},
    error::AppError,
    handlers::{ensure_attempts_left, ensure_can_manage, load_course_item},
    models::test::{GenerateRequest, GenerateResponse},
    repository::{
        course_items::find_term,
        instances::create_instance,
        questions::{bump_usage, load_generator_cache},
        templates::find_template,
        tests::{VariantOwner, insert_variants},
    },
    state::AppState,
    utils::jwt::Claims,
};

/// Generates test variants for a course item term.
///
/// * `count`: that many shared variants labelled A, B, ...
/// * `participants`: one individualized variant per participant, each bound to a new Ready instance.
///
/// The whole batch is sampled before anything is written, then persisted in one
/// transaction. Any failure leaves no tests behind.
pub async fn generate_variants(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((course_item_id, term_id)): Path<(i64, i64)>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let user_id = claims.user_id()?;

    let mut tx = state.pool.begin().await?;

    let item = load_course_item(&mut tx, course_item_id).await?;
    ensure_can_manage(&claims, &item)?;

    let term = find_term(&mut tx, term_id)
        .await?
        .filter(|t| t.course_item_id == item.id)
        .ok_or_else(|| AppError::NotFound("Term not found".to_string()))?;

    let template_id = item.template_id.ok_or_else(|| {
        AppError::UnprocessableEntity("Course item has no template assigned".to_string())
    })?;
    let template = find_template(&mut tx, template_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Template not found".to_string()))?;

    if let Some(participants) = &req.participants {
        for participant_id in participants {
            ensure_attempts_left(&mut tx, &item, &term, *participant_id).await?;
        }
    }

    let cache = load_generator_cache(&mut tx, &template).await?;

    let targets: Vec<VariantTarget> = match (&req.count, &req.participants) {
        (Some(count), _) => (0..*count as usize).map(VariantTarget::labelled).collect(),
        (None, Some(participants)) => participants
            .iter()
            .copied()
            .map(VariantTarget::participant)
            .collect(),
        (None, None) => Vec::new(),
    };

    let mut rng = StdRng::from_os_rng();
    let variants = generate_batch(
        &template,
        &cache,
        &targets,
        state.config.generation_max_tries,
        &mut rng,
    )?;

    let owner = VariantOwner {
        course_id: item.course_id,
        course_item_id: item.id,
        term_id: term.id,
        created_by_id: user_id,
    };
    let test_ids = insert_variants(
        &mut tx,
        owner,
        &variants,
        state.config.generation_batch_size,
    )
    .await?;
    bump_usage(&mut tx, &usage_counts(&variants)).await?;

    let mut instance_ids = Vec::new();
    for (variant, test_id) in variants.iter().zip(&test_ids) {
        if let Some(participant_id) = variant.participant_id {
            let id = create_instance(
                &mut tx,
                *test_id,
                participant_id,
                term.id,
                item.id,
                req.form,
            )
            .await?;
            instance_ids.push(id);
        }
    }

    tx.commit().await?;

    tracing::info!(
        course_item_id = item.id,
        term_id = term.id,
        template_id = template.id,
        variants = test_ids.len(),
        instances = instance_ids.len(),
        "Generated test variants"
    );

    Ok((
        StatusCode::CREATED,
        Json(GenerateResponse {
            test_ids,
            instance_ids,
        }),
    ))
}
