use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::models::instance::{
    InstanceAnswer, InstanceEvent, InstanceForm, InstanceQuestion, TestInstance,
};

const INSTANCE_COLUMNS: &str = r#"
    id, test_id, participant_id, term_id, course_item_id, state, form,
    started_at, ends_at, ended_at, bonus_points, bonus_points_reason, created_at
"#;

pub async fn find_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> Result<Option<TestInstance>, sqlx::Error> {
    sqlx::query_as::<_, TestInstance>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM test_instances WHERE id = $1"
    ))
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Same as `find_instance` but holds a row lock until the transaction ends.
pub async fn lock_instance(
    conn: &mut PgConnection,
    instance_id: i64,
) -> Result<Option<TestInstance>, sqlx::Error> {
    sqlx::query_as::<_, TestInstance>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM test_instances WHERE id = $1 FOR UPDATE"
    ))
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Creates a Ready instance and its empty per-question response rows.
pub async fn create_instance(
    conn: &mut PgConnection,
    test_id: i64,
    participant_id: i64,
    term_id: i64,
    course_item_id: i64,
    form: InstanceForm,
) -> Result<i64, sqlx::Error> {
    let instance_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO test_instances (test_id, participant_id, term_id, course_item_id, state, form)
        VALUES ($1, $2, $3, $4, 'READY', $5)
        RETURNING id
        "#,
    )
    .bind(test_id)
    .bind(participant_id)
    .bind(term_id)
    .bind(course_item_id)
    .bind(form)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO test_instance_questions (instance_id, test_question_id)
        SELECT $1, id FROM test_questions WHERE test_id = $2 ORDER BY position
        "#,
    )
    .bind(instance_id)
    .bind(test_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO test_instance_answers (instance_question_id, test_question_answer_id)
        SELECT iq.id, tqa.id
        FROM test_instance_questions iq
        JOIN test_question_answers tqa ON tqa.test_question_id = iq.test_question_id
        WHERE iq.instance_id = $1
        ORDER BY iq.id, tqa.order_index
        "#,
    )
    .bind(instance_id)
    .execute(&mut *conn)
    .await?;

    Ok(instance_id)
}

/// Instances the participant has for a course item, overall and within one term.
pub async fn count_attempts(
    conn: &mut PgConnection,
    participant_id: i64,
    course_item_id: i64,
    term_id: i64,
) -> Result<(i64, i64), sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT COUNT(*), COUNT(*) FILTER (WHERE term_id = $3)
        FROM test_instances
        WHERE participant_id = $1 AND course_item_id = $2
        "#,
    )
    .bind(participant_id)
    .bind(course_item_id)
    .bind(term_id)
    .fetch_one(&mut *conn)
    .await
}

/// Serializes Start transitions and attempt accounting of one participant
/// for the rest of the transaction.
pub async fn lock_participant(conn: &mut PgConnection, participant_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(participant_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// The participant's Active instances whose deadline has passed.
pub async fn overdue_active_for_participant(
    conn: &mut PgConnection,
    participant_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT id FROM test_instances
        WHERE participant_id = $1 AND state = 'ACTIVE' AND ends_at <= $2
        ORDER BY id
        "#,
    )
    .bind(participant_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
}

pub async fn has_other_active(
    conn: &mut PgConnection,
    participant_id: i64,
    instance_id: i64,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM test_instances
            WHERE participant_id = $1 AND id <> $2 AND state = 'ACTIVE'
        )
        "#,
    )
    .bind(participant_id)
    .bind(instance_id)
    .fetch_one(&mut *conn)
    .await
}

/// Writes back the lifecycle columns of an instance.
pub async fn update_instance(conn: &mut PgConnection, instance: &TestInstance) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE test_instances
        SET state = $2, started_at = $3, ends_at = $4, ended_at = $5,
            bonus_points = $6, bonus_points_reason = $7
        WHERE id = $1
        "#,
    )
    .bind(instance.id)
    .bind(instance.state)
    .bind(instance.started_at)
    .bind(instance.ends_at)
    .bind(instance.ended_at)
    .bind(instance.bonus_points)
    .bind(&instance.bonus_points_reason)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

const QUESTION_SELECT: &str = r#"
    SELECT iq.id, tq.block_id, tq.question_format, tq.position AS "order",
           iq.text_answer, iq.reviewed_by_id, iq.percentage
    FROM test_instance_questions iq
    JOIN test_questions tq ON tq.id = iq.test_question_id
"#;

const ANSWER_SELECT: &str = r#"
    SELECT ia.id, ia.instance_question_id, tqa.correct, tqa.order_index AS "order", ia.selected
    FROM test_instance_answers ia
    JOIN test_question_answers tqa ON tqa.id = ia.test_question_answer_id
"#;

/// Loads every response row of an instance in display order, answers attached.
pub async fn load_questions(
    conn: &mut PgConnection,
    instance_id: i64,
) -> Result<Vec<InstanceQuestion>, sqlx::Error> {
    let mut questions = sqlx::query_as::<_, InstanceQuestion>(&format!(
        "{QUESTION_SELECT} WHERE iq.instance_id = $1 ORDER BY tq.position"
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;

    let answers = sqlx::query_as::<_, InstanceAnswer>(&format!(
        r#"{ANSWER_SELECT}
        JOIN test_instance_questions iq ON iq.id = ia.instance_question_id
        WHERE iq.instance_id = $1
        ORDER BY tqa.order_index"#
    ))
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?;

    for answer in answers {
        if let Some(question) = questions
            .iter_mut()
            .find(|q| q.id == answer.instance_question_id)
        {
            question.answers.push(answer);
        }
    }

    Ok(questions)
}

/// Loads one response row of an instance.
pub async fn load_question(
    conn: &mut PgConnection,
    instance_id: i64,
    question_id: i64,
) -> Result<Option<InstanceQuestion>, sqlx::Error> {
    let question = sqlx::query_as::<_, InstanceQuestion>(&format!(
        "{QUESTION_SELECT} WHERE iq.instance_id = $1 AND iq.id = $2"
    ))
    .bind(instance_id)
    .bind(question_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut question) = question else {
        return Ok(None);
    };

    question.answers = sqlx::query_as::<_, InstanceAnswer>(&format!(
        "{ANSWER_SELECT} WHERE ia.instance_question_id = $1 ORDER BY tqa.order_index"
    ))
    .bind(question.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(question))
}

/// Writes back the response state of one question and its answer selections.
pub async fn save_question(conn: &mut PgConnection, question: &InstanceQuestion) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE test_instance_questions
        SET text_answer = $2, reviewed_by_id = $3, percentage = $4
        WHERE id = $1
        "#,
    )
    .bind(question.id)
    .bind(&question.text_answer)
    .bind(question.reviewed_by_id)
    .bind(question.percentage)
    .execute(&mut *conn)
    .await?;

    if question.answers.is_empty() {
        return Ok(());
    }

    let (ids, selected): (Vec<i64>, Vec<bool>) =
        question.answers.iter().map(|a| (a.id, a.selected)).unzip();

    sqlx::query(
        r#"
        UPDATE test_instance_answers ia
        SET selected = u.selected
        FROM UNNEST($1::BIGINT[], $2::BOOLEAN[]) AS u(id, selected)
        WHERE ia.id = u.id
        "#,
    )
    .bind(&ids)
    .bind(&selected)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn insert_events(conn: &mut PgConnection, events: &[InstanceEvent]) -> Result<(), sqlx::Error> {
    if events.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO test_instance_events (instance_id, user_id, occurred_at, event_type, event_data) ",
    );
    builder.push_values(events, |mut row, event| {
        row.push_bind(event.instance_id)
            .push_bind(event.user_id)
            .push_bind(event.occurred_at)
            .push_bind(event.event_type)
            .push_bind(&event.event_data);
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

/// Deletes the instance's result, then the instance (responses and events cascade).
pub async fn delete_instance(conn: &mut PgConnection, instance_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query("DELETE FROM course_item_results WHERE test_instance_id = $1")
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("DELETE FROM test_instances WHERE id = $1")
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Active instances whose deadline has passed.
pub async fn overdue_active_ids(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT id FROM test_instances WHERE state = 'ACTIVE' AND ends_at <= $1 ORDER BY id",
    )
    .bind(now)
    .fetch_all(&mut *conn)
    .await
}

/// Marks never-started online instances of closed terms as Expired.
pub async fn expire_unstarted(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE test_instances ti
        SET state = 'EXPIRED'
        FROM terms t
        WHERE ti.term_id = t.id
          AND ti.state = 'READY'
          AND ti.form = 'ONLINE'
          AND t.active_to <= $1
        RETURNING ti.id
        "#,
    )
    .bind(now)
    .fetch_all(&mut *conn)
    .await
}
