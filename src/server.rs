//! Axum router construction and middleware.
//!
//! Every route lives under `/server` and requires the static inter-node
//! token.  Layer ordering: the auth middleware runs closest to the
//! handlers; the request-id middleware wraps the full request so even
//! auth failures carry an id.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};

use crate::envelope;
use crate::errors::StopCause;
use crate::handlers;
use crate::rpc::{AUTHORIZATION_TOKEN, HEADER_AUTHORIZATION_TOKEN};
use crate::AppState;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Build the axum [`Router`] with every membership route.
///
/// The returned router must be served with
/// `into_make_service_with_connect_info::<SocketAddr>()` so handlers can
/// observe caller addresses.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Generic status, used by unknown nodes probing a socket.
        .route("/server", get(server_status))
        // Master-side actions, called by slaves.
        .route("/server/master", get(handlers::master::master_status))
        .route(
            "/server/master/notify",
            put(handlers::master::notify_add)
                .patch(handlers::master::notify_modify)
                .delete(handlers::master::notify_remove),
        )
        // Slave-side actions, called by the master.
        .route("/server/slave", get(handlers::slave::slave_status))
        .route(
            "/server/slave/notify/takeover",
            post(handlers::slave::notify_takeover),
        )
        .route(
            "/server/slave/notify/switch_superior",
            post(handlers::slave::notify_switch_superior),
        )
        // Operator actions.
        .route("/server/start", post(start_worker))
        .route("/server/stop", post(stop_worker))
        .with_state(state)
        .layer(middleware::from_fn(auth_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

// -- Middleware --------------------------------------------------------------

/// Reject any request not presenting the fleet's static token.
async fn auth_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(HEADER_AUTHORIZATION_TOKEN)
        .and_then(|value| value.to_str().ok())
        == Some(AUTHORIZATION_TOKEN);
    if !authorized {
        return envelope::fail(StatusCode::UNAUTHORIZED, 1, "authorization token invalid");
    }
    next.run(req).await
}

/// Stamp every response with an `X-Request-ID`.
async fn request_id_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    if !response.headers().contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

// -- Status and operator actions ---------------------------------------------

/// `GET /server` — liveness ping for unknown nodes.
async fn server_status() -> Response {
    envelope::ok_empty()
}

/// `POST /server/start` — start the master worker.  Conflicts when it is
/// already running.
async fn start_worker(State(state): State<Arc<AppState>>) -> Response {
    let Some(pool) = state.pool() else {
        return handlers::not_supported();
    };
    if pool.is_master_working() {
        return envelope::fail(StatusCode::CONFLICT, 1, "master worker is working");
    }
    match pool.start(crate::config::IDENTITY_MASTER).await {
        Ok(()) => envelope::ok_empty(),
        Err(e) => envelope::fail_with(
            StatusCode::BAD_REQUEST,
            1,
            "failed to start master worker",
            e.to_string(),
        ),
    }
}

/// `POST /server/stop` — orderly stop of the membership core.  Conflicts
/// when the master worker is not running.
async fn stop_worker(State(state): State<Arc<AppState>>) -> Response {
    let Some(pool) = state.pool() else {
        return handlers::not_supported();
    };
    if !pool.is_master_working() {
        return envelope::fail(StatusCode::CONFLICT, 1, "master worker is not working");
    }
    pool.stop(StopCause::EndpointStopped).await;
    envelope::ok_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_id() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
