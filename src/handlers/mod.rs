// src/handlers/mod.rs

pub mod generation;
pub mod instance;
pub mod review;
pub mod terms;

use sqlx::PgConnection;

use crate::{
    engine::lifecycle::{AttemptUsage, ensure_attempt_available},
    error::AppError,
    models::course_item::{CourseItem, Term},
    repository::{course_items::find_course_item, instances},
    utils::jwt::Claims,
};

/// Loads a course item or fails with 404.
pub(crate) async fn load_course_item(
    conn: &mut PgConnection,
    course_item_id: i64,
) -> Result<CourseItem, AppError> {
    find_course_item(conn, course_item_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Course item not found".to_string()))
}

/// Admins manage everything; tutors only the course items they created.
pub(crate) fn ensure_can_manage(claims: &Claims, item: &CourseItem) -> Result<(), AppError> {
    if claims.is_admin() || (claims.is_reviewer() && claims.user_id()? == item.created_by_id) {
        return Ok(());
    }
    Err(AppError::Forbidden(
        "Not allowed to manage this course item".to_string(),
    ))
}

/// Rejects a new instance for a participant whose attempt budget on the item
/// or the term is used up. Holds the participant lock until the transaction ends.
pub(crate) async fn ensure_attempts_left(
    conn: &mut PgConnection,
    item: &CourseItem,
    term: &Term,
    participant_id: i64,
) -> Result<(), AppError> {
    let group_max_attempts = match item.parent_id {
        Some(parent_id) => Some(load_course_item(conn, parent_id).await?.max_attempts),
        None => None,
    };

    instances::lock_participant(conn, participant_id).await?;
    let (item_attempts, term_attempts) =
        instances::count_attempts(conn, participant_id, item.id, term.id).await?;

    ensure_attempt_available(
        participant_id,
        AttemptUsage {
            item_max_attempts: item.max_attempts,
            group_max_attempts,
            item_attempts,
            term_tries: term.tries,
            term_attempts,
        },
    )?;
    Ok(())
}
