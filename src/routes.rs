// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{delete, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{generation, instance, review, terms},
    state::AppState,
    utils::jwt::{auth_middleware, tutor_middleware},
};

/// Assembles the main application router.
///
/// * Participant routes only need a valid token; ownership is checked per instance.
/// * Reviewer routes additionally require the tutor or admin role.
/// * Global middleware: Trace, CORS.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`, the
/// participant handlers read the client address from `ConnectInfo`.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let participant_routes = Router::new()
        .route("/instances/{id}/start", post(instance::start_instance))
        .route("/instances/{id}/questions", put(instance::save_response))
        .route("/instances/{id}/finish", post(instance::finish_instance))
        .route("/terms/{term}/join", post(terms::join));

    let reviewer_routes = Router::new()
        .route(
            "/course-items/{item}/terms/{term}/generate",
            post(generation::generate_variants),
        )
        .route("/tests/{test}/instances", post(instance::create_instance))
        .route("/instances/{id}/review", post(review::tutor_finish))
        .route("/instances/{id}/evaluate", post(review::evaluate_instance))
        .route("/instances/{id}", delete(review::delete_instance))
        .layer(middleware::from_fn(tutor_middleware));

    let api = participant_routes
        .merge(reviewer_routes)
        // Auth runs first, then the role check on reviewer routes
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
