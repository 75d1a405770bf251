use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};

use crate::auth::middleware::JwtSecret;
use crate::state::AppState;
use crate::ws::{endpoints, handler as ws_handler};

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (auth via query param or bearer header)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // Authenticated hub endpoints (Claims extractor validates token)
    let hub_routes = Router::new()
        .route("/api/ws/online-users", get(endpoints::online_users))
        .route(
            "/api/ws/broadcast/list/{id}",
            post(endpoints::broadcast_to_list),
        )
        .route("/api/ws/notify/{user_id}", post(endpoints::notify_user));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(hub_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
