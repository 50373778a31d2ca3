use sqlx::PgConnection;

use crate::{
    engine::scoring::select_result,
    models::{
        instance::TestInstance,
        result::{EvaluateBy, ItemResult},
    },
};

const RESULT_COLUMNS: &str = r#"
    id, student_id, course_item_id, term_id, test_instance_id, points,
    is_final, selected, version, updated_by_id, created_at
"#;

/// Returns the result row of an instance, creating an empty one on first use.
/// The row stays locked until the transaction ends.
pub async fn find_or_create_for_instance(
    conn: &mut PgConnection,
    instance: &TestInstance,
) -> Result<ItemResult, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO course_item_results (student_id, course_item_id, term_id, test_instance_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (test_instance_id) DO NOTHING
        "#,
    )
    .bind(instance.participant_id)
    .bind(instance.course_item_id)
    .bind(instance.term_id)
    .bind(instance.id)
    .execute(&mut *conn)
    .await?;

    sqlx::query_as::<_, ItemResult>(&format!(
        "SELECT {RESULT_COLUMNS} FROM course_item_results WHERE test_instance_id = $1 FOR UPDATE"
    ))
    .bind(instance.id)
    .fetch_one(&mut *conn)
    .await
}

pub async fn save_result(conn: &mut PgConnection, result: &ItemResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE course_item_results
        SET points = $2, is_final = $3, version = $4, updated_by_id = $5
        WHERE id = $1
        "#,
    )
    .bind(result.id)
    .bind(result.points)
    .bind(result.is_final)
    .bind(result.version)
    .bind(result.updated_by_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Recomputes which of a student's results counts for the course item.
/// Returns the selected result id, if any result is final.
pub async fn update_selected_result(
    conn: &mut PgConnection,
    student_id: i64,
    course_item_id: i64,
    evaluate_by: EvaluateBy,
) -> Result<Option<i64>, sqlx::Error> {
    let results = sqlx::query_as::<_, ItemResult>(&format!(
        r#"
        SELECT {RESULT_COLUMNS}
        FROM course_item_results
        WHERE student_id = $1 AND course_item_id = $2
        "#
    ))
    .bind(student_id)
    .bind(course_item_id)
    .fetch_all(&mut *conn)
    .await?;

    let selected = select_result(&results, evaluate_by);

    sqlx::query(
        r#"
        UPDATE course_item_results
        SET selected = COALESCE(id = $3, FALSE)
        WHERE student_id = $1 AND course_item_id = $2
        "#,
    )
    .bind(student_id)
    .bind(course_item_id)
    .bind(selected)
    .execute(&mut *conn)
    .await?;

    Ok(selected)
}
