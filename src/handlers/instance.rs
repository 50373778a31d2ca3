// src/handlers/instance.rs

use std::net::{IpAddr, SocketAddr};

use axum::{
    Extension, Json,
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use sqlx::{Postgres, Transaction};
use validator::Validate;

use crate::{
    engine::{
        error::EngineError,
        lifecycle::{self, StartContext},
    },
    error::AppError,
    handlers::{
        ensure_attempts_left, ensure_can_manage, load_course_item,
        review::{expire_and_score, store_evaluation},
    },
    models::{
        course_item::CourseItem,
        instance::{
            CreateInstanceRequest, FinishInstanceRequest, QuestionResponse,
            StartInstanceResponse, TestInstance,
        },
    },
    repository::{
        course_items::{find_term, is_joined},
        instances,
        tests::find_test,
    },
    state::AppState,
    utils::jwt::Claims,
};

/// Binds an existing test to a participant as a Ready instance.
pub async fn create_instance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(test_id): Path<i64>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;

    let mut tx = state.pool.begin().await?;

    let test = find_test(&mut tx, test_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Test not found".to_string()))?;
    let item = load_course_item(&mut tx, test.course_item_id).await?;
    ensure_can_manage(&claims, &item)?;

    let term = find_term(&mut tx, req.term_id)
        .await?
        .filter(|t| t.course_item_id == item.id)
        .ok_or_else(|| AppError::NotFound("Term not found".to_string()))?;

    ensure_attempts_left(&mut tx, &item, &term, req.participant_id).await?;

    let instance_id = instances::create_instance(
        &mut tx,
        test.id,
        req.participant_id,
        term.id,
        item.id,
        req.form,
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        instance_id,
        test_id = test.id,
        participant_id = req.participant_id,
        "Instance created"
    );

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": instance_id })),
    ))
}

/// Loads the caller's own instance under a row lock.
async fn lock_own_instance(
    tx: &mut Transaction<'static, Postgres>,
    instance_id: i64,
    participant_id: i64,
) -> Result<(TestInstance, CourseItem), AppError> {
    let instance = instances::lock_instance(tx, instance_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Instance not found".to_string()))?;
    if instance.participant_id != participant_id {
        return Err(EngineError::NotOwner.into());
    }
    let item = load_course_item(tx, instance.course_item_id).await?;
    Ok((instance, item))
}

/// Rejects addresses outside the course item's allow-list.
///
/// The rejection is recorded as an INVALIDIP event and committed on its own,
/// so the caller gets the error while the audit trail keeps the attempt.
async fn guard_network(
    mut tx: Transaction<'static, Postgres>,
    instance: &TestInstance,
    item: &CourseItem,
    participant_id: i64,
    address: IpAddr,
) -> Result<Transaction<'static, Postgres>, AppError> {
    let Err(err) = lifecycle::check_network(&item.ip_ranges, address) else {
        return Ok(tx);
    };

    tracing::warn!(
        instance_id = instance.id,
        participant_id,
        address = %address,
        "Instance access from outside the allowed network"
    );

    let event = lifecycle::invalid_ip_event(instance.id, participant_id, address, Utc::now());
    instances::insert_events(&mut tx, &[event]).await?;
    tx.commit().await?;

    Err(err.into())
}

/// Starts the timer of a Ready online instance.
pub async fn start_instance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(instance_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let participant_id = claims.user_id()?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let (mut instance, item) = lock_own_instance(&mut tx, instance_id, participant_id).await?;
    let mut tx = guard_network(tx, &instance, &item, participant_id, addr.ip()).await?;

    let term = find_term(&mut tx, instance.term_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Term not found".to_string()))?;

    let joined_term = is_joined(&mut tx, term.id, participant_id).await?;

    instances::lock_participant(&mut tx, participant_id).await?;
    for stale_id in instances::overdue_active_for_participant(&mut tx, participant_id, now).await? {
        if let Some(stale) = instances::lock_instance(&mut tx, stale_id).await? {
            expire_and_score(&mut tx, stale, state.config.scoring, now).await?;
        }
    }
    let another_active = instances::has_other_active(&mut tx, participant_id, instance.id).await?;

    let event = lifecycle::start(
        &mut instance,
        participant_id,
        StartContext {
            now,
            time_limit_minutes: item.time_limit_minutes,
            term_active_to: term.active_to,
            joined_term,
            another_active,
        },
    )?;

    instances::update_instance(&mut tx, &instance)
        .await
        .map_err(|e| {
            // Backstop for the partial unique index on Active instances.
            if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
                AppError::from(EngineError::AnotherInstanceActive)
            } else {
                AppError::from(e)
            }
        })?;
    instances::insert_events(&mut tx, &[event]).await?;

    tx.commit().await?;

    let ends_at = instance.ends_at.unwrap_or(now);
    tracing::info!(
        instance_id = instance.id,
        participant_id,
        ends_at = %ends_at,
        "Instance started"
    );

    Ok(Json(StartInstanceResponse {
        instance_id: instance.id,
        ends_at,
    }))
}

/// Saves one question's response while the instance is running.
pub async fn save_response(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(instance_id): Path<i64>,
    Json(req): Json<QuestionResponse>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let participant_id = claims.user_id()?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let (instance, item) = lock_own_instance(&mut tx, instance_id, participant_id).await?;
    let mut tx = guard_network(tx, &instance, &item, participant_id, addr.ip()).await?;

    let mut question = instances::load_question(&mut tx, instance.id, req.id)
        .await?
        .ok_or(EngineError::UnknownQuestion(req.id))?;

    let events = lifecycle::save(&instance, &mut question, &req, participant_id, now)
        .inspect_err(|err| {
            tracing::warn!(instance_id = instance.id, participant_id, error = %err, "Save rejected");
        })?;

    if !events.is_empty() {
        instances::save_question(&mut tx, &question).await?;
        instances::insert_events(&mut tx, &events).await?;
    }
    tx.commit().await?;

    Ok(Json(serde_json::json!({ "changes": events.len() })))
}

/// Participant submission: applies every response, finishes and scores.
pub async fn finish_instance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(instance_id): Path<i64>,
    Json(req): Json<FinishInstanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let participant_id = claims.user_id()?;
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let (mut instance, item) = lock_own_instance(&mut tx, instance_id, participant_id).await?;
    let mut tx = guard_network(tx, &instance, &item, participant_id, addr.ip()).await?;

    let mut questions = instances::load_questions(&mut tx, instance.id).await?;
    let events = lifecycle::finish(&mut instance, &mut questions, &req.questions, participant_id, now)
        .inspect_err(|err| {
            tracing::warn!(instance_id = instance.id, participant_id, error = %err, "Finish rejected");
        })?;

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
        None,
        now,
    )
    .await?;

    tx.commit().await?;

    tracing::info!(instance_id = instance.id, participant_id, "Instance finished");

    Ok(Json(response))
}
