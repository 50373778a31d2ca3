// src/handlers/terms.rs

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use sqlx::PgPool;

use crate::{
    error::AppError,
    repository::course_items::{JoinOutcome, join_term},
    utils::jwt::Claims,
};

/// Joins the caller to a term, respecting its student limit.
pub async fn join(
    State(pool): State<PgPool>,
    Extension(claims): Extension<Claims>,
    Path(term_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = claims.user_id()?;

    let mut tx = pool.begin().await?;
    let outcome = join_term(&mut tx, term_id, user_id).await?;

    match outcome {
        JoinOutcome::TermNotFound => Err(AppError::NotFound("Term not found".to_string())),
        JoinOutcome::Full => Err(AppError::Conflict("Term is full".to_string())),
        JoinOutcome::AlreadyJoined => Ok(Json(serde_json::json!({ "joined": true, "new": false }))),
        JoinOutcome::Joined => {
            tx.commit().await?;
            tracing::info!(term_id, user_id, "Joined term");
            Ok(Json(serde_json::json!({ "joined": true, "new": true })))
        }
    }
}
