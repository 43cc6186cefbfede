//! Actions a slave answers for its master: the liveness probe and the
//! takeover / switch-superior notifications.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Form;

use super::{header_u64, not_supported};
use crate::envelope;
use crate::errors::NodeError;
use crate::rpc::HEADER_NODE_ID;
use crate::store::records::RegisteredNodeInfo;
use crate::AppState;

/// `GET /server/slave` — liveness probe.
pub async fn slave_status(State(state): State<Arc<AppState>>) -> Response {
    if state.pool().is_none() {
        return not_supported();
    }
    envelope::ok_empty()
}

/// `POST /server/slave/notify/takeover` — the departing master instructs
/// this slave to take over.  The caller must present its own id.
pub async fn notify_takeover(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(departing): Form<RegisteredNodeInfo>,
) -> Response {
    let Some(pool) = state.pool() else {
        return not_supported();
    };
    if header_u64(&headers, HEADER_NODE_ID) != Some(departing.id) {
        return envelope::fail(StatusCode::FORBIDDEN, 1, "invalid master node id");
    }
    match pool.supersede(&departing).await {
        Ok(()) => envelope::ok_empty(),
        Err(e) => envelope::fail_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            1,
            "failed to take over",
            e.to_string(),
        ),
    }
}

/// `POST /server/slave/notify/switch_superior` — the departing master
/// announces its successor; this slave re-parents onto it.
pub async fn notify_switch_superior(
    State(state): State<Arc<AppState>>,
    Form(new_master): Form<RegisteredNodeInfo>,
) -> Response {
    let Some(pool) = state.pool() else {
        return not_supported();
    };
    match pool.switch_superior(&new_master).await {
        Ok(()) => envelope::ok_empty(),
        Err(e @ NodeError::MasterInvalid) => envelope::fail_with(
            StatusCode::BAD_REQUEST,
            1,
            "failed to switch superior",
            e.to_string(),
        ),
        Err(e) => envelope::fail_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            1,
            "failed to switch superior",
            e.to_string(),
        ),
    }
}
