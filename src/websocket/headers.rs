//! Header transforms shared by both legs of a proxied connection.
//!
//! # Responsibilities
//! - Copy header sets without dropping multi-valued entries
//! - Strip hop-by-hop headers, including those a `Connection` header declares
//! - Strip the handshake headers the dialer regenerates on its own
//!
//! # Design Decisions
//! - `HeaderMap` stores names lowercase, so every lookup is case-insensitive
//! - All transforms mutate in place and are idempotent

use axum::http::header::{self, HeaderMap, HeaderName};

/// Headers that are scoped to a single connection and never cross legs.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 12] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    HeaderName::from_static("trailers"),
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::SEC_WEBSOCKET_ACCEPT,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
];

/// Handshake headers removed from the outbound request before dialing.
pub static WEBSOCKET_DIAL_HEADERS: [HeaderName; 6] = [
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_ACCEPT,
];

/// Append every value of every header in `src` to `dst`.
pub fn copy(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Remove hop-by-hop headers from `headers` (RFC 7230, section 6.1).
///
/// Headers named by `Connection` directives go first, then the static list.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    remove_connection_headers(headers);
    remove_all(headers, &HOP_BY_HOP_HEADERS);
}

/// Remove the headers the dial capability adds itself.
pub fn strip_dial_headers(headers: &mut HeaderMap) {
    remove_all(headers, &WEBSOCKET_DIAL_HEADERS);
}

/// Remove every header declared by a `Connection` directive.
pub fn remove_connection_headers(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(tokens)
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in declared {
        headers.remove(name);
    }
}

/// Whether any value of `name` contains `token` as a comma-separated element.
///
/// Comparison is ASCII case-insensitive, as for `Connection` and `Upgrade`.
pub fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(tokens)
        .any(|candidate| candidate.eq_ignore_ascii_case(token))
}

fn tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|token| !token.is_empty())
}

fn remove_all(headers: &mut HeaderMap, names: &[HeaderName]) {
    for name in names {
        headers.remove(name);
    }
}
