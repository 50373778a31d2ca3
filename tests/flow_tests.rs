// tests/flow_tests.rs
//
// Runs against the Postgres in DATABASE_URL. Every test seeds its own course,
// template and participants, so the tests can share one database.

use std::net::SocketAddr;

use assessment_engine::{
    config::Config,
    engine::sampler::variant_label,
    jobs, routes,
    state::AppState,
    utils::jwt::{ROLE_STUDENT, ROLE_TUTOR, sign_jwt},
};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use sqlx::{PgPool, postgres::PgPoolOptions};

const JWT_SECRET: &str = "flow_test_secret";

async fn spawn_app() -> (String, AppState) {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres for testing.");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to migrate database");

    let config = Config::from_source(|key| match key {
        "DATABASE_URL" => Some(database_url.clone()),
        "JWT_SECRET" => Some(JWT_SECRET.to_string()),
        "RUST_LOG" => Some("error".to_string()),
        "SWEEP_INTERVAL_SECS" => Some("0".to_string()),
        _ => None,
    })
    .expect("Failed to build test config");

    let state = AppState { pool, config };
    let app = routes::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (address, state)
}

fn unique_id() -> i64 {
    i64::from(rand::random::<u32>()) + 1_000_000
}

fn bearer(user_id: i64, role: &str) -> String {
    sign_jwt(user_id, role, JWT_SECRET, 600).unwrap()
}

struct Fixture {
    course_item_id: i64,
    term_id: i64,
    tutor_id: i64,
}

struct Limits {
    student_limit: Option<i32>,
    max_attempts: i32,
    tries: i32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            student_limit: None,
            max_attempts: 5,
            tries: 5,
        }
    }
}

/// A course item worth 10 points whose template has a 60% choice block
/// (1 question, 2 picked answers) and a 40% open block (1 question).
async fn seed(pool: &PgPool, limits: Limits) -> Fixture {
    let course_id = unique_id();
    let tutor_id = unique_id();
    let chapter_id: i64 = 1;

    let template_id: i64 = sqlx::query_scalar(
        "INSERT INTO templates (course_id, title) VALUES ($1, 'Quiz') RETURNING id",
    )
    .bind(course_id)
    .fetch_one(pool)
    .await
    .unwrap();

    for (position, weight, format, answer_count) in [(1, 60, "TEST", 2), (2, 40, "OPEN", 0)] {
        let block_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO template_blocks
                (template_id, position, weight, question_format, question_count,
                 answer_count, answer_distribution)
            VALUES ($1, $2, $3, $4::question_format, 1, $5, 'MINIMUM_ONE_CORRECT_ONE_INCORRECT')
            RETURNING id
            "#,
        )
        .bind(template_id)
        .bind(position)
        .bind(weight)
        .bind(format)
        .bind(answer_count)
        .fetch_one(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO template_block_segments (block_id, chapter_id, question_count) VALUES ($1, $2, 1)",
        )
        .bind(block_id)
        .bind(chapter_id)
        .execute(pool)
        .await
        .unwrap();

        let question_id: i64 = sqlx::query_scalar(
            "INSERT INTO questions (course_id, chapter_id, question_format) VALUES ($1, $2, $3::question_format) RETURNING id",
        )
        .bind(course_id)
        .bind(chapter_id)
        .bind(format)
        .fetch_one(pool)
        .await
        .unwrap();

        if format == "TEST" {
            for correct in [true, false, false] {
                sqlx::query("INSERT INTO answers (question_id, correct) VALUES ($1, $2)")
                    .bind(question_id)
                    .bind(correct)
                    .execute(pool)
                    .await
                    .unwrap();
            }
        }
    }

    let course_item_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO course_items
            (course_id, created_by_id, template_id, points_max, time_limit_minutes, max_attempts)
        VALUES ($1, $2, $3, 10, 30, $4)
        RETURNING id
        "#,
    )
    .bind(course_id)
    .bind(tutor_id)
    .bind(template_id)
    .bind(limits.max_attempts)
    .fetch_one(pool)
    .await
    .unwrap();

    let now = Utc::now();
    let term_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO terms (course_item_id, active_from, active_to, tries, student_limit)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(course_item_id)
    .bind(now - Duration::hours(1))
    .bind(now + Duration::days(1))
    .bind(limits.tries)
    .bind(limits.student_limit)
    .fetch_one(pool)
    .await
    .unwrap();

    Fixture {
        course_item_id,
        term_id,
        tutor_id,
    }
}

async fn join(client: &reqwest::Client, address: &str, term_id: i64, student: i64) -> reqwest::Response {
    client
        .post(format!("{}/api/terms/{}/join", address, term_id))
        .bearer_auth(bearer(student, ROLE_STUDENT))
        .send()
        .await
        .expect("Failed to execute request")
}

async fn generate(client: &reqwest::Client, address: &str, fx: &Fixture, body: Value) -> Value {
    let response = client
        .post(format!(
            "{}/api/course-items/{}/terms/{}/generate",
            address, fx.course_item_id, fx.term_id
        ))
        .bearer_auth(bearer(fx.tutor_id, ROLE_TUTOR))
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 201);
    response.json().await.unwrap()
}

async fn create_instance(
    client: &reqwest::Client,
    address: &str,
    fx: &Fixture,
    test_id: i64,
    student: i64,
) -> reqwest::Response {
    client
        .post(format!("{}/api/tests/{}/instances", address, test_id))
        .bearer_auth(bearer(fx.tutor_id, ROLE_TUTOR))
        .json(&json!({ "participant_id": student, "term_id": fx.term_id, "form": "ONLINE" }))
        .send()
        .await
        .expect("Failed to execute request")
}

async fn start(client: &reqwest::Client, address: &str, instance_id: i64, student: i64) -> reqwest::Response {
    client
        .post(format!("{}/api/instances/{}/start", address, instance_id))
        .bearer_auth(bearer(student, ROLE_STUDENT))
        .send()
        .await
        .expect("Failed to execute request")
}

/// One shared test plus `count` Ready instances of it for `student`.
async fn ready_instances(
    client: &reqwest::Client,
    address: &str,
    fx: &Fixture,
    student: i64,
    count: usize,
) -> Vec<i64> {
    let generated = generate(client, address, fx, json!({ "count": 1 })).await;
    let test_id = generated["test_ids"][0].as_i64().unwrap();

    let mut ids = Vec::new();
    for _ in 0..count {
        let response = create_instance(client, address, fx, test_id, student).await;
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        ids.push(body["id"].as_i64().unwrap());
    }
    ids
}

#[tokio::test]
async fn participant_variant_runs_from_start_to_evaluation() {
    let (address, state) = spawn_app().await;
    let pool = &state.pool;
    let client = reqwest::Client::new();
    let fx = seed(pool, Limits::default()).await;
    let student = unique_id();

    assert_eq!(join(&client, &address, fx.term_id, student).await.status().as_u16(), 200);

    // 1. Generate one individualized variant with its Ready instance
    let generated = generate(&client, &address, &fx, json!({ "participants": [student] })).await;
    let test_id = generated["test_ids"][0].as_i64().unwrap();
    let instance_id = generated["instance_ids"][0].as_i64().unwrap();

    let positions: Vec<i32> =
        sqlx::query_scalar("SELECT position FROM test_questions WHERE test_id = $1 ORDER BY position")
            .bind(test_id)
            .fetch_all(pool)
            .await
            .unwrap();
    assert_eq!(positions, vec![1, 2]);

    let response_rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM test_instance_questions WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(response_rows, 2);

    // 2. Start
    let response = start(&client, &address, instance_id, student).await;
    assert_eq!(response.status().as_u16(), 200);

    // 3. Finish with the choice question answered perfectly and the open one typed
    let answers: Vec<(i64, i64, bool)> = sqlx::query_as(
        r#"
        SELECT iq.id, ia.id, tqa.correct
        FROM test_instance_answers ia
        JOIN test_question_answers tqa ON tqa.id = ia.test_question_answer_id
        JOIN test_instance_questions iq ON iq.id = ia.instance_question_id
        WHERE iq.instance_id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .unwrap();
    assert_eq!(answers.len(), 2);
    let choice_id = answers[0].0;

    let open_id: i64 = sqlx::query_scalar(
        r#"
        SELECT iq.id FROM test_instance_questions iq
        JOIN test_questions tq ON tq.id = iq.test_question_id
        WHERE iq.instance_id = $1 AND tq.question_format = 'OPEN'
        "#,
    )
    .bind(instance_id)
    .fetch_one(pool)
    .await
    .unwrap();

    let selections: Vec<Value> = answers
        .iter()
        .map(|(_, id, correct)| json!({ "id": id, "selected": correct }))
        .collect();

    let finished: Value = client
        .post(format!("{}/api/instances/{}/finish", address, instance_id))
        .bearer_auth(bearer(student, ROLE_STUDENT))
        .json(&json!({
            "questions": [
                { "id": choice_id, "answers": selections },
                { "id": open_id, "text_answer": "my answer" }
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(finished["result"]["points"].as_f64(), Some(6.0));
    assert_eq!(finished["result"]["is_final"].as_bool(), Some(false));
    assert_eq!(finished["result"]["selected"].as_bool(), Some(false));

    // 4. Tutor grades the open question at 50%
    let reviewed: Value = client
        .post(format!("{}/api/instances/{}/review", address, instance_id))
        .bearer_auth(bearer(fx.tutor_id, ROLE_TUTOR))
        .json(&json!({
            "questions": [
                { "id": open_id, "text_answer_percentage": 50.0, "text_answer_reviewed": true }
            ]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reviewed["result"]["points"].as_f64(), Some(8.0));
    assert_eq!(reviewed["result"]["is_final"].as_bool(), Some(true));
    assert_eq!(reviewed["result"]["selected"].as_bool(), Some(true));
    assert_eq!(reviewed["result"]["version"].as_i64(), Some(2));

    // 5. Re-evaluation keeps the score and bumps the version
    let evaluated: Value = client
        .post(format!("{}/api/instances/{}/evaluate", address, instance_id))
        .bearer_auth(bearer(fx.tutor_id, ROLE_TUTOR))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(evaluated["result"]["points"].as_f64(), Some(8.0));
    assert_eq!(evaluated["result"]["version"].as_i64(), Some(3));
    assert_eq!(evaluated["result"]["updated_by_id"].as_i64(), Some(fx.tutor_id));
}

#[tokio::test]
async fn batch_ids_follow_variant_order() {
    let (address, state) = spawn_app().await;
    let client = reqwest::Client::new();
    let fx = seed(&state.pool, Limits::default()).await;

    let generated = generate(&client, &address, &fx, json!({ "count": 3 })).await;
    let test_ids: Vec<i64> = generated["test_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_i64().unwrap())
        .collect();
    assert_eq!(test_ids.len(), 3);

    for (n, test_id) in test_ids.iter().enumerate() {
        let label: String = sqlx::query_scalar("SELECT group_label FROM tests WHERE id = $1")
            .bind(test_id)
            .fetch_one(&state.pool)
            .await
            .unwrap();
        assert_eq!(label, variant_label(n));

        let (questions, answers): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT tq.id), COUNT(tqa.id)
            FROM test_questions tq
            LEFT JOIN test_question_answers tqa ON tqa.test_question_id = tq.id
            WHERE tq.test_id = $1
            "#,
        )
        .bind(test_id)
        .fetch_one(&state.pool)
        .await
        .unwrap();
        assert_eq!((questions, answers), (2, 2));
    }

    let usage: Vec<i32> = sqlx::query_scalar(
        r#"
        SELECT q.times_used FROM questions q
        JOIN course_items ci ON ci.course_id = q.course_id
        WHERE ci.id = $1
        "#,
    )
    .bind(fx.course_item_id)
    .fetch_all(&state.pool)
    .await
    .unwrap();
    assert_eq!(usage, vec![3, 3]);
}

#[tokio::test]
async fn second_start_is_rejected_while_one_is_active() {
    let (address, state) = spawn_app().await;
    let client = reqwest::Client::new();
    let fx = seed(&state.pool, Limits::default()).await;
    let student = unique_id();
    join(&client, &address, fx.term_id, student).await;

    let ids = ready_instances(&client, &address, &fx, student, 2).await;

    assert_eq!(start(&client, &address, ids[0], student).await.status().as_u16(), 200);
    assert_eq!(start(&client, &address, ids[1], student).await.status().as_u16(), 409);

    // The partial unique index refuses a second Active row outright.
    let err = sqlx::query("UPDATE test_instances SET state = 'ACTIVE' WHERE id = $1")
        .bind(ids[1])
        .execute(&state.pool)
        .await
        .unwrap_err();
    assert!(err.as_database_error().is_some_and(|db| db.is_unique_violation()));
}

#[tokio::test]
async fn start_expires_and_scores_overdue_instance() {
    let (address, state) = spawn_app().await;
    let pool = &state.pool;
    let client = reqwest::Client::new();
    let fx = seed(pool, Limits::default()).await;
    let student = unique_id();
    join(&client, &address, fx.term_id, student).await;

    let ids = ready_instances(&client, &address, &fx, student, 2).await;
    let now = Utc::now();
    sqlx::query(
        "UPDATE test_instances SET state = 'ACTIVE', started_at = $2, ends_at = $3 WHERE id = $1",
    )
    .bind(ids[0])
    .bind(now - Duration::minutes(60))
    .bind(now - Duration::minutes(30))
    .execute(pool)
    .await
    .unwrap();

    assert_eq!(start(&client, &address, ids[1], student).await.status().as_u16(), 200);

    let (stored_state, ends_at, ended_at): (String, Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>) =
        sqlx::query_as("SELECT state::text, ends_at, ended_at FROM test_instances WHERE id = $1")
            .bind(ids[0])
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(stored_state, "EXPIRED");
    assert!(ended_at.is_some());
    assert_eq!(ended_at, ends_at);

    let (results, updated_by): (i64, Option<i64>) = sqlx::query_as(
        "SELECT COUNT(*), MAX(updated_by_id) FROM course_item_results WHERE test_instance_id = $1",
    )
    .bind(ids[0])
    .fetch_one(pool)
    .await
    .unwrap();
    assert_eq!(results, 1);
    assert_eq!(updated_by, None);
}

#[tokio::test]
async fn sweeper_scores_overdue_instance() {
    let (address, state) = spawn_app().await;
    let pool = &state.pool;
    let client = reqwest::Client::new();
    let fx = seed(pool, Limits::default()).await;
    let student = unique_id();
    join(&client, &address, fx.term_id, student).await;

    let ids = ready_instances(&client, &address, &fx, student, 1).await;
    let now = Utc::now();
    sqlx::query(
        "UPDATE test_instances SET state = 'ACTIVE', started_at = $2, ends_at = $3 WHERE id = $1",
    )
    .bind(ids[0])
    .bind(now - Duration::minutes(45))
    .bind(now - Duration::minutes(15))
    .execute(pool)
    .await
    .unwrap();

    let report = jobs::sweep_once(&state, now).await.unwrap();
    assert_eq!(report.failed, 0);

    let stored_state: String = sqlx::query_scalar("SELECT state::text FROM test_instances WHERE id = $1")
        .bind(ids[0])
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(stored_state, "EXPIRED");

    let results: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM course_item_results WHERE test_instance_id = $1")
            .bind(ids[0])
            .fetch_one(pool)
            .await
            .unwrap();
    assert_eq!(results, 1);
}

#[tokio::test]
async fn full_term_rejects_join() {
    let (address, state) = spawn_app().await;
    let client = reqwest::Client::new();
    let fx = seed(
        &state.pool,
        Limits {
            student_limit: Some(1),
            ..Limits::default()
        },
    )
    .await;
    let first = unique_id();
    let second = unique_id();

    assert_eq!(join(&client, &address, fx.term_id, first).await.status().as_u16(), 200);
    assert_eq!(join(&client, &address, fx.term_id, second).await.status().as_u16(), 409);

    let again: Value = join(&client, &address, fx.term_id, first).await.json().await.unwrap();
    assert_eq!(again["new"].as_bool(), Some(false));
}

#[tokio::test]
async fn attempt_budget_blocks_new_instance() {
    let (address, state) = spawn_app().await;
    let client = reqwest::Client::new();
    let fx = seed(
        &state.pool,
        Limits {
            max_attempts: 1,
            tries: 3,
            ..Limits::default()
        },
    )
    .await;
    let student = unique_id();

    let ids = ready_instances(&client, &address, &fx, student, 1).await;
    let test_id: i64 = sqlx::query_scalar("SELECT test_id FROM test_instances WHERE id = $1")
        .bind(ids[0])
        .fetch_one(&state.pool)
        .await
        .unwrap();

    let response = create_instance(&client, &address, &fx, test_id, student).await;
    assert_eq!(response.status().as_u16(), 409);

    let response = client
        .post(format!(
            "{}/api/course-items/{}/terms/{}/generate",
            address, fx.course_item_id, fx.term_id
        ))
        .bearer_auth(bearer(fx.tutor_id, ROLE_TUTOR))
        .json(&json!({ "participants": [student] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn start_requires_joined_term() {
    let (address, state) = spawn_app().await;
    let client = reqwest::Client::new();
    let fx = seed(&state.pool, Limits::default()).await;
    let student = unique_id();

    let ids = ready_instances(&client, &address, &fx, student, 1).await;
    assert_eq!(start(&client, &address, ids[0], student).await.status().as_u16(), 403);
}
