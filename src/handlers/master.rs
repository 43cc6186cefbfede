//! Actions a master answers for its slaves: the status probe and the
//! admission / removal notifications.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Form;
use serde::Deserialize;

use super::{header_u64, not_supported};
use crate::envelope;
use crate::errors::NodeError;
use crate::rpc::{
    MasterStatusData, MasterStatusExt, SlaveRegistrationData, HEADER_NODE_ID, HEADER_NODE_PORT,
};
use crate::store::records::FreshNodeInfo;
use crate::AppState;

/// `GET /server/master` — status, as probed by slaves.
///
/// A caller presenting `X-Node-ID` and `X-Node-Port` matching a roster
/// entry has just proven it is alive: its retry counter is cleared and
/// it is reported as attended.  The response echoes the caller's
/// observed addresses so the slave can validate its own registration.
pub async fn master_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(pool) = state.pool() else {
        return not_supported();
    };
    let mut attended = false;
    if let Some(node_id) = header_u64(&headers, HEADER_NODE_ID) {
        pool.slaves.retry_clear(node_id).await;
        if let Some(slave) = pool.slaves.get(node_id).await {
            if header_u64(&headers, HEADER_NODE_PORT) == Some(u64::from(slave.port)) {
                attended = true;
            }
        }
    }
    let data = MasterStatusData {
        host: headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        client_ip: addr.ip().to_string(),
        remote_addr: addr.to_string(),
        attended,
        is_master_working: pool.is_master_working(),
        is_slave_working: pool.is_slave_working(),
    };
    let ext = MasterStatusExt {
        master: pool.current_master_registered(),
        slaves: Some(pool.slaves.registered_infos().await),
    };
    envelope::ok(Some(data), Some(ext))
}

/// `PUT /server/master/notify` — a fresh peer asks to join as a slave.
///
/// The recorded host is the caller's IP as this process observed it, not
/// the self-reported one; the extension reports whether the two agreed.
pub async fn notify_add(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(mut fresh): Form<FreshNodeInfo>,
) -> Response {
    let Some(pool) = state.pool() else {
        return not_supported();
    };
    let presented_host = std::mem::replace(&mut fresh.host, addr.ip().to_string());
    match pool.accept_slave(&fresh).await {
        Ok(slave) => {
            let data = SlaveRegistrationData {
                id: slave.id,
                name: slave.name.clone(),
                node_version: slave.node_version.clone(),
                host: slave.host.clone(),
                port: slave.port,
                turn: slave.turn,
            };
            envelope::ok(Some(data), Some(presented_host == fresh.host))
        }
        Err(e) => envelope::fail_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            1,
            "failed to accept slave",
            e.to_string(),
        ),
    }
}

/// `PATCH /server/master/notify` — reserved.
pub async fn notify_modify(State(state): State<Arc<AppState>>) -> Response {
    if state.pool().is_none() {
        return not_supported();
    }
    envelope::ok_empty()
}

/// Identity fields a withdrawing slave presents in the removal query.
#[derive(Debug, Deserialize)]
pub struct RemoveSlaveQuery {
    pub id: u64,
    pub name: String,
    pub node_version: String,
    pub host: String,
    pub port: u16,
}

/// `DELETE /server/master/notify?id&name&node_version&host&port` — a
/// slave asks to be removed.  The host is validated against the caller's
/// IP; a mismatching identity is forbidden.
pub async fn notify_remove(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<RemoveSlaveQuery>,
) -> Response {
    let Some(pool) = state.pool() else {
        return not_supported();
    };
    let fresh = FreshNodeInfo {
        name: query.name,
        node_version: query.node_version,
        host: addr.ip().to_string(),
        port: query.port,
    };
    match pool.remove_slave(query.id, &fresh).await {
        Ok(()) => envelope::ok_empty(),
        Err(e @ NodeError::SlaveFreshInfoInvalid) => envelope::fail_with(
            StatusCode::FORBIDDEN,
            1,
            "failed to remove slave",
            e.to_string(),
        ),
        Err(e) => envelope::fail_with(
            StatusCode::INTERNAL_SERVER_ERROR,
            1,
            "failed to remove slave",
            e.to_string(),
        ),
    }
}
