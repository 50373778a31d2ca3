use sqlx::PgConnection;

use crate::models::course_item::{CourseItem, Term};

/// Outcome of a capacity-checked term join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    Full,
    TermNotFound,
}

pub async fn find_course_item(
    conn: &mut PgConnection,
    course_item_id: i64,
) -> Result<Option<CourseItem>, sqlx::Error> {
    sqlx::query_as::<_, CourseItem>(
        r#"
        SELECT id, course_id, parent_id, created_by_id, template_id, points_max,
               time_limit_minutes, ip_ranges, max_attempts, evaluate_by
        FROM course_items
        WHERE id = $1
        "#,
    )
    .bind(course_item_id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn find_term(conn: &mut PgConnection, term_id: i64) -> Result<Option<Term>, sqlx::Error> {
    sqlx::query_as::<_, Term>(
        "SELECT id, course_item_id, active_from, active_to, tries, student_limit FROM terms WHERE id = $1",
    )
    .bind(term_id)
    .fetch_optional(&mut *conn)
    .await
}

pub async fn is_joined(conn: &mut PgConnection, term_id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM user_terms WHERE term_id = $1 AND user_id = $2)")
        .bind(term_id)
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
}

/// Adds a student to a term unless it is full.
///
/// The term row is locked for the count and the insert, so concurrent joins
/// cannot overshoot `student_limit`. Run inside a transaction.
pub async fn join_term(
    conn: &mut PgConnection,
    term_id: i64,
    user_id: i64,
) -> Result<JoinOutcome, sqlx::Error> {
    let term = sqlx::query_as::<_, Term>(
        r#"
        SELECT id, course_item_id, active_from, active_to, tries, student_limit
        FROM terms
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(term_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(term) = term else {
        return Ok(JoinOutcome::TermNotFound);
    };

    if is_joined(conn, term_id, user_id).await? {
        return Ok(JoinOutcome::AlreadyJoined);
    }

    if let Some(limit) = term.student_limit {
        let joined: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_terms WHERE term_id = $1")
            .bind(term_id)
            .fetch_one(&mut *conn)
            .await?;
        if joined >= i64::from(limit) {
            return Ok(JoinOutcome::Full);
        }
    }

    sqlx::query("INSERT INTO user_terms (user_id, term_id) VALUES ($1, $2)")
        .bind(user_id)
        .bind(term_id)
        .execute(&mut *conn)
        .await?;

    Ok(JoinOutcome::Joined)
}
