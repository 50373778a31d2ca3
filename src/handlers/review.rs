// src/handlers/review.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use validator::Validate;

use crate::{
    engine::{
        lifecycle,
        scoring::{self, ScoringPolicy},
    },
    error::AppError,
    handlers::{ensure_can_manage, load_course_item},
    models::{
        course_item::CourseItem,
        instance::{InstanceQuestion, TestInstance, TutorFinishRequest},
        result::EvaluationResponse,
    },
    repository::{instances, results, tests::find_test},
    state::AppState,
    utils::jwt::Claims,
};

/// Scores an instance, writes its result and refreshes the student's selected
/// result for the course item. `updated_by` is None for unattended runs.
pub(crate) async fn store_evaluation(
    conn: &mut PgConnection,
    instance: &TestInstance,
    item: &CourseItem,
    questions: &[InstanceQuestion],
    policy: ScoringPolicy,
    updated_by: Option<i64>,
    now: DateTime<Utc>,
) -> Result<EvaluationResponse, AppError> {
    let test = find_test(conn, instance.test_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Test not found".to_string()))?;

    let evaluation = scoring::evaluate(
        instance,
        &test.blocks.0,
        questions,
        item.points_max,
        policy,
        now,
    )?;

    let mut result = results::find_or_create_for_instance(conn, instance).await?;
    scoring::apply_evaluation(&mut result, &evaluation, updated_by);
    results::save_result(conn, &result).await?;

    let selected = results::update_selected_result(
        conn,
        instance.participant_id,
        instance.course_item_id,
        item.evaluate_by,
    )
    .await?;
    result.selected = selected == Some(result.id);

    tracing::info!(
        instance_id = instance.id,
        participant_id = instance.participant_id,
        points = result.points,
        is_final = result.is_final,
        version = result.version,
        "Instance evaluated"
    );

    Ok(EvaluationResponse {
        result,
        blocks: evaluation.blocks,
    })
}

/// Stores Expired for an overdue Active instance and scores it unattended.
///
/// Returns false when the instance is not overdue. The caller must hold the
/// instance's row lock.
pub(crate) async fn expire_and_score(
    conn: &mut PgConnection,
    mut instance: TestInstance,
    policy: ScoringPolicy,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    if !lifecycle::expire(&mut instance, now) {
        return Ok(false);
    }

    instances::update_instance(conn, &instance).await?;
    let item = load_course_item(conn, instance.course_item_id).await?;
    let questions = instances::load_questions(conn, instance.id).await?;
    store_evaluation(conn, &instance, &item, &questions, policy, None, now).await?;

    tracing::info!(
        instance_id = instance.id,
        participant_id = instance.participant_id,
        "Overdue instance expired"
    );
    Ok(true)
}

/// Loads an instance under a row lock together with its course item, checking
/// that the caller may manage it.
async fn lock_managed_instance(
    conn: &mut PgConnection,
    claims: &Claims,
    instance_id: i64,
) -> Result<(TestInstance, CourseItem), AppError> {
    let instance = instances::lock_instance(conn, instance_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Instance not found".to_string()))?;
    let item = load_course_item(conn, instance.course_item_id).await?;
    ensure_can_manage(claims, &item)?;
    Ok((instance, item))
}

/// Reviewer override: grades responses, sets bonus points and force-finishes
/// Ready or Active instances. Scores synchronously.
pub async fn tutor_finish(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(instance_id): Path<i64>,
    Json(req): Json<TutorFinishRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let reviewer_id = claims.user_id()?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let (mut instance, item) = lock_managed_instance(&mut tx, &claims, instance_id).await?;
    let previous_state = instance.state;

    let mut questions = instances::load_questions(&mut tx, instance.id).await?;
    let events = lifecycle::tutor_finish(
        &mut instance,
        &mut questions,
        &req.questions,
        req.bonus_points,
        &req.bonus_points_reason,
        reviewer_id,
        now,
    )?;

    instances::update_instance(&mut tx, &instance).await?;
    for question in &questions {
        instances::save_question(&mut tx, question).await?;
    }
    instances::insert_events(&mut tx, &events).await?;

    let response = store_evaluation(
        &mut tx,
        &instance,
        &item,
        &questions,
        state.config.scoring,
        Some(reviewer_id),
        now,
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        instance_id = instance.id,
        reviewer_id,
        from = ?previous_state,
        to = ?instance.state,
        "Instance reviewed"
    );

    Ok(Json(response))
}

/// Re-scores a finished or expired instance from its current response state.
pub async fn evaluate_instance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(instance_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let reviewer_id = claims.user_id()?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let (instance, item) = lock_managed_instance(&mut tx, &claims, instance_id).await?;
    let questions = instances::load_questions(&mut tx, instance.id).await?;

    let response = store_evaluation(
        &mut tx,
        &instance,
        &item,
        &questions,
        state.config.scoring,
        Some(reviewer_id),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(Json(response))
}

/// Deletes an instance together with its result.
pub async fn delete_instance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(instance_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let mut tx = state.pool.begin().await?;
    let (instance, item) = lock_managed_instance(&mut tx, &claims, instance_id).await?;

    instances::delete_instance(&mut tx, instance.id).await?;
    results::update_selected_result(
        &mut tx,
        instance.participant_id,
        instance.course_item_id,
        item.evaluate_by,
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        instance_id = instance.id,
        participant_id = instance.participant_id,
        "Instance deleted"
    );

    Ok(axum::http::StatusCode::NO_CONTENT)
}

