//! Inbound side of the handshake.
//!
//! # Responsibilities
//! - Check that the inbound request is a WebSocket upgrade we can complete
//! - Build the 101 response from the backend's (stripped) handshake headers
//! - Relay a backend's non-101 answer to the client as-is
//!
//! # Design Decisions
//! - Origin is never checked here; callers enforce it before the proxy
//! - Rejections carry only the status text, never internal error detail

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, Response, StatusCode};
use axum::response::IntoResponse;
use hyper::upgrade::OnUpgrade;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::websocket::dialer::HandshakeResponse;
use crate::websocket::error::UpgradeError;
use crate::websocket::headers;

/// Response headers staged by middleware that runs before the proxy.
///
/// They are appended to the 101 response after the backend's headers.
#[derive(Debug, Clone, Default)]
pub struct PresetHeaders(pub HeaderMap);

/// Validate an inbound upgrade request and return its `Sec-WebSocket-Key`.
pub fn validate(request: &Parts) -> Result<HeaderValue, UpgradeError> {
    let headers = &request.headers;

    if !headers::has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(UpgradeError::MissingConnectionUpgrade);
    }
    if !headers::has_token(headers, &header::UPGRADE, "websocket") {
        return Err(UpgradeError::MissingUpgradeWebsocket);
    }
    if request.method != Method::GET {
        return Err(UpgradeError::MethodNotGet);
    }
    if !headers::has_token(headers, &header::SEC_WEBSOCKET_VERSION, "13") {
        return Err(UpgradeError::UnsupportedVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .filter(|key| !key.is_empty())
        .cloned()
        .ok_or(UpgradeError::MissingKey)?;

    // The connection must be able to hand over its IO after the 101.
    if request.extensions.get::<OnUpgrade>().is_none() {
        return Err(UpgradeError::UpgradeUnavailable);
    }

    Ok(key)
}

/// Build the 101 response completing the client's handshake.
pub fn switching_protocols(
    key: &HeaderValue,
    merged: HeaderMap,
) -> Result<Response<Body>, axum::http::Error> {
    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()))
        .body(Body::empty())?;

    headers::copy(response.headers_mut(), &merged);
    Ok(response)
}

/// Re-create the backend's handshake answer for the client.
///
/// The body is what the dialer collected. Framing headers are dropped and
/// the server frames that body again, so `content-length` stays exact when
/// the body was capped.
pub fn passthrough(backend: &HandshakeResponse) -> Result<Response<Body>, axum::http::Error> {
    let body = backend.body().clone().unwrap_or_default();
    let mut response = Response::builder()
        .status(backend.status())
        .body(Body::from(body))?;

    headers::copy(response.headers_mut(), backend.headers());
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response.headers_mut().remove(header::TRANSFER_ENCODING);
    Ok(response)
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let text = status.canonical_reason().unwrap_or_default();
        (
            status,
            [(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"))],
            text,
        )
            .into_response()
    }
}
