//! Target rewriting for outbound requests.
//!
//! A director maps the inbound request URI onto the backend target. The
//! single-host director keeps the target's scheme, authority and path prefix,
//! appends the request path with exactly one `/` between them, prefixes the
//! target query, and switches `http`/`https` to `ws`/`wss`.

use std::sync::Arc;

use axum::http::header::{HeaderValue, USER_AGENT};
use axum::http::uri::{PathAndQuery, Uri};
use axum::http::Request;
use url::{Position, Url};

/// Rewrites an outbound request in place before it is dialed.
pub type Director = Arc<dyn Fn(&mut Request<()>) + Send + Sync>;

/// Build a director that sends every request to `target`.
pub fn single_host_director(target: Url) -> Director {
    let scheme = target.scheme().to_string();
    let authority = target[Position::BeforeHost..Position::AfterPort].to_string();
    let base_path = target.path().to_string();
    let target_query = target.query().unwrap_or_default().to_string();

    Arc::new(move |request: &mut Request<()>| {
        let path = single_joining_slash(&base_path, request.uri().path());
        let query = merge_query(&target_query, request.uri().query().unwrap_or_default());

        match rewrite_uri(websocket_scheme(&scheme), &authority, &path, &query) {
            Ok(uri) => *request.uri_mut() = uri,
            // Only a target without a host (`mailto:`, `data:`) gets here. The
            // URI stays origin-form and the dialer rejects it as malformed.
            Err(err) => {
                tracing::warn!(error = %err, target = %authority, "Failed to rewrite request URI");
            }
        }

        // An explicit empty value stops a dialer from adding its own.
        if !request.headers().contains_key(USER_AGENT) {
            request
                .headers_mut()
                .insert(USER_AGENT, HeaderValue::from_static(""));
        }
    })
}

/// Join two path segments with exactly one `/` between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Target query first; `&` only when both sides are non-empty.
pub fn merge_query(target: &str, request: &str) -> String {
    if target.is_empty() || request.is_empty() {
        format!("{target}{request}")
    } else {
        format!("{target}&{request}")
    }
}

/// Map an HTTP scheme onto its WebSocket counterpart.
pub fn websocket_scheme(scheme: &str) -> &str {
    match scheme {
        "http" => "ws",
        "https" => "wss",
        other => other,
    }
}

fn rewrite_uri(
    scheme: &str,
    authority: &str,
    path: &str,
    query: &str,
) -> Result<Uri, axum::http::Error> {
    let path_and_query = if query.is_empty() {
        PathAndQuery::try_from(path)?
    } else {
        PathAndQuery::try_from(format!("{path}?{query}"))?
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}
