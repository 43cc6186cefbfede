//! HTTP action handlers.
//!
//! Thin adapters between the axum surface and the membership pool.
//! `master` holds the actions a master answers for its slaves; `slave`
//! holds the actions a slave answers for its master.

pub mod master;
pub mod slave;

use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

use crate::envelope;

/// The response every membership action gives when the process runs with
/// identity 0.
pub(crate) fn not_supported() -> Response {
    envelope::fail(StatusCode::BAD_REQUEST, 1, "not supported")
}

/// Parse a numeric header, if present and well-formed.
pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_u64() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Node-ID", HeaderValue::from_static("42"));
        headers.insert("X-Node-Port", HeaderValue::from_static("eight"));
        assert_eq!(header_u64(&headers, "X-Node-ID"), Some(42));
        assert_eq!(header_u64(&headers, "X-Node-Port"), None);
        assert_eq!(header_u64(&headers, "X-Missing"), None);
    }
}
