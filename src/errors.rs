//! Membership error taxonomy.
//!
//! Every variant is a *kind*, not a wrapper: the supervisors and the
//! membership controller branch on these values the same way the store
//! branches on row state.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(NodeError::SlaveFreshInfoInvalid)`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::envelope;

/// Errors produced by the store, the RPC client, and the membership
/// controller.
#[derive(Debug, Error)]
pub enum NodeError {
    // -- Topology ------------------------------------------------------------
    /// The node is at level 0; there is no superior to look for.
    #[error("it's already the highest level")]
    LevelAlreadyHighest,

    /// No live record exists one level up.
    #[error("superior node not exist")]
    SuperiorNotExist,

    /// The master reference is absent or names an unknown record.
    #[error("master node invalid")]
    MasterInvalid,

    /// A live master already answers on the socket this process holds.
    #[error("a valid master node with the same socket already exists")]
    MasterExisted,

    /// The discovered master record carries this process's own socket.
    #[error("master node is self")]
    MasterIsSelf,

    /// The master answered, but with a non-OK status.
    #[error("master is valid but refuse to communicate")]
    MasterValidButRefused,

    /// The specified slave node is invalid.
    #[error("the specified slave node is invalid")]
    SlaveInvalid,

    /// The caller's identity fields disagree with the registered record.
    #[error("invalid slave fresh node info")]
    SlaveFreshInfoInvalid,

    /// The id is not among this master's admitted slaves.
    #[error("the specified slave node does not exist on the current master node")]
    MasterDoesNotHaveSpecifiedSlave,

    /// A live node already answers on the socket being claimed.
    #[error("a valid node with the same socket already exists")]
    NodeExisted,

    // -- Transport -----------------------------------------------------------
    /// The request could not be constructed.
    #[error("invalid node request")]
    RequestInvalid,

    /// The request was sent but transport failed (timeout, refused, DNS).
    #[error("node request response error")]
    RequestResponseError,

    /// No non-loopback interface is available to advertise.
    #[error("network unavailable")]
    NetworkUnavailable,

    // -- Consistency ---------------------------------------------------------
    /// The stored master row disagrees with the in-memory snapshot, or a
    /// version-conditioned update matched nothing: another node already
    /// acted.
    #[error("the record of master is not valid")]
    MasterRecordInvalid,

    /// The reloaded master is not the immediate superior of this node.
    #[error("the specified master is not the superior of this node")]
    MasterNotSuperior,

    /// The handover candidate is not an immediate subordinate.
    #[error("the specified candidate is not a subordinate of this node")]
    SlaveNotSubordinate,

    /// The row looked up by id is gone.
    #[error("record not found")]
    RecordNotFound,

    // -- Persistence ---------------------------------------------------------
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl NodeError {
    /// HTTP status this error translates to at the action surface.
    ///
    /// 400 for malformed or unknown input, 403 for caller-identity
    /// mismatch, 500 for everything the caller cannot repair.
    pub fn status_code(&self) -> StatusCode {
        match self {
            NodeError::MasterInvalid | NodeError::RequestInvalid => StatusCode::BAD_REQUEST,
            NodeError::SlaveFreshInfoInvalid => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        envelope::fail(self.status_code(), 1, self.to_string())
    }
}

/// Why a supervisor (or the whole membership core) is being stopped.
///
/// Causes are carried through the cancellation channel and logged by the
/// stopping worker; they also steer the stop flow itself (a superseded
/// master neither notifies nor deletes, a taking-over slave skips the
/// goodbye call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// This slave is taking over the master role.
    TakeoverMaster,
    /// The master withdrew gracefully.
    ExistedMasterWithdrawn,
    /// Orderly stop requested at the endpoint.
    EndpointStopped,
    /// Plain worker shutdown.
    WorkerStopped,
    /// Process-level signal (SIGINT / SIGTERM).
    SystemSignalStopped,
    /// The stored self record no longer matches: superseded while unaware.
    MasterRecordInvalid,
    /// The master no longer knows this slave; it must re-join.
    SlaveEvicted,
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopCause::TakeoverMaster => "taking over master",
            StopCause::ExistedMasterWithdrawn => "existed master withdrawn",
            StopCause::EndpointStopped => "endpoint stopped",
            StopCause::WorkerStopped => "worker stopped",
            StopCause::SystemSignalStopped => "system signal stopped",
            StopCause::MasterRecordInvalid => "the record of master is not valid",
            StopCause::SlaveEvicted => "evicted by master",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            NodeError::SlaveFreshInfoInvalid.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(NodeError::MasterInvalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(NodeError::RequestInvalid.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            NodeError::MasterRecordInvalid.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            NodeError::NodeExisted.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_stop_cause_display() {
        assert_eq!(StopCause::WorkerStopped.to_string(), "worker stopped");
        assert_eq!(
            StopCause::MasterRecordInvalid.to_string(),
            "the record of master is not valid"
        );
    }
}
