//! Generic response envelope.
//!
//! Every HTTP response — success or failure, served or received — uses the
//! same JSON shape: `{code, message, data, ext}` with `code = 0` on
//! success and a small positive integer otherwise.  The RPC client parses
//! peer responses back into the same type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

/// The envelope carried by every response.
///
/// `data` is the operation payload, `ext` is side-channel information
/// (e.g. the slave roster attached to a master status response).  Both are
/// omitted from the wire when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: Deserialize<'de>, E: Deserialize<'de>"))]
pub struct Generic<D, E> {
    pub code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<D>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<E>,
}

/// An envelope with no payload on either channel.
pub type Plain = Generic<serde_json::Value, serde_json::Value>;

impl<D, E> Generic<D, E> {
    pub fn new(code: u32, message: impl Into<String>, data: Option<D>, ext: Option<E>) -> Self {
        Generic {
            code,
            message: message.into(),
            data,
            ext,
        }
    }
}

/// 200 OK with `code = 0` and both channels populated as given.
pub fn ok<D: Serialize, E: Serialize>(data: Option<D>, ext: Option<E>) -> Response {
    (StatusCode::OK, Json(Generic::new(0, "success", data, ext))).into_response()
}

/// 200 OK with `code = 0` and no payload.
pub fn ok_empty() -> Response {
    ok::<serde_json::Value, serde_json::Value>(None, None)
}

/// Failure envelope with the given status and `code`.
pub fn fail(status: StatusCode, code: u32, message: impl Into<String>) -> Response {
    (
        status,
        Json(Generic::<serde_json::Value, serde_json::Value>::new(
            code,
            message,
            None,
            None,
        )),
    )
        .into_response()
}

/// Failure envelope carrying detail in the data channel, the way
/// action handlers report the underlying error text.
pub fn fail_with(
    status: StatusCode,
    code: u32,
    message: impl Into<String>,
    detail: impl Into<String>,
) -> Response {
    (
        status,
        Json(Generic::<String, serde_json::Value>::new(
            code,
            message,
            Some(detail.into()),
            None,
        )),
    )
        .into_response()
}
