//! Proxy entry point.
//!
//! # Responsibilities
//! - Build the outbound request and run the director over it
//! - Dial the backend and branch on the outcome (hard failure, soft failure, 101)
//! - Complete the client's upgrade and hand both connections to a session task
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → outbound request (headers cloned, director applied, dial headers removed)
//!     → dialer
//!         ├─ no response       → error handler (default: 502, empty body)
//!         ├─ non-101 response  → backend response relayed to the client
//!         └─ 101               → 101 to the client, session task spawned
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderMap};
use axum::http::request::Parts;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use hyper::upgrade::OnUpgrade;
use url::Url;

use crate::config::schema::UpstreamConfig;
use crate::lifecycle::{SessionId, SessionTracker};
use crate::observability::logging::Logger;
use crate::observability::metrics::{self, DialFailure};
use crate::websocket::dialer::{DefaultDialer, Dialer};
use crate::websocket::director::{single_host_director, Director};
use crate::websocket::error::{DialError, ProxyError};
use crate::websocket::headers;
use crate::websocket::session::{self, ConnectionClosedHook, SessionContext};
use crate::websocket::upgrade::{self, PresetHeaders};

/// Turns a failed proxy attempt into the client's response.
pub type ErrorHandler = Arc<dyn Fn(&Parts, &ProxyError) -> Response<Body> + Send + Sync>;

/// WebSocket reverse proxy.
///
/// Cloning is cheap; every clone shares the same director, dialer, hooks
/// and session tracker.
#[derive(Clone)]
pub struct WebsocketProxy {
    director: Director,
    dialer: Arc<dyn Dialer>,
    error_handler: Option<ErrorHandler>,
    closed_hook: Option<ConnectionClosedHook>,
    logger: Logger,
    tracker: SessionTracker,
}

impl WebsocketProxy {
    /// Create a proxy around `director` with the default dialer.
    pub fn new(director: Director) -> Self {
        Self {
            director,
            dialer: Arc::new(DefaultDialer::default()),
            error_handler: None,
            closed_hook: None,
            logger: Logger::default(),
            tracker: SessionTracker::new(),
        }
    }

    /// Create a proxy that sends every request to `target`.
    pub fn single_host(target: Url) -> Self {
        Self::new(single_host_director(target))
    }

    /// Create a proxy from the `[upstream]` section.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, url::ParseError> {
        let target = Url::parse(&config.target)?;
        let dialer = DefaultDialer::new(Duration::from_secs(config.connect_timeout_secs));
        Ok(Self::single_host(target).with_dialer(dialer))
    }

    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_closed_hook(mut self, hook: ConnectionClosedHook) -> Self {
        self.closed_hook = Some(hook);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Share an existing tracker, e.g. the server's.
    pub fn with_tracker(mut self, tracker: SessionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Tracker counting this proxy's live sessions.
    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Proxy one inbound upgrade request.
    ///
    /// Returns the response for the client. On success that is the 101 and
    /// the relay runs on a spawned task once the connection is upgraded.
    pub async fn serve<B>(&self, request: Request<B>) -> Response<Body> {
        // Upgrade requests carry no body.
        let (mut parts, body) = request.into_parts();
        drop(body);

        let outbound = self.outbound_request(&parts);
        let host = inbound_host(&parts);

        let (backend, handshake) = match self
            .dialer
            .dial(outbound.uri(), outbound.headers().clone())
            .await
        {
            Ok(dialed) => dialed,
            Err(DialError::Handshake { response }) => {
                metrics::record_dial_failure(DialFailure::Soft);
                self.logger.in_scope(|| {
                    tracing::info!(host = %host, status = %response.status(), "Backend declined upgrade");
                });
                return match upgrade::passthrough(&response) {
                    Ok(passthrough) => passthrough,
                    Err(err) => self.handle_error(&parts, ProxyError::Forward(err)),
                };
            }
            Err(err) => {
                metrics::record_dial_failure(DialFailure::Hard);
                self.logger.in_scope(|| {
                    tracing::error!(host = %host, error = %err, "Error dialing");
                });
                return self.handle_error(&parts, ProxyError::Dial(err));
            }
        };

        let mut merged = handshake.headers().clone();
        headers::strip_hop_by_hop(&mut merged);
        if let Some(PresetHeaders(preset)) = parts.extensions.remove::<PresetHeaders>() {
            headers::copy(&mut merged, &preset);
        }

        let key = match upgrade::validate(&parts) {
            Ok(key) => key,
            Err(err) => {
                metrics::record_upgrade_failure();
                self.logger.in_scope(|| {
                    tracing::warn!(host = %host, error = %err, "Couldn't upgrade");
                });
                return err.into_response();
            }
        };

        let response = match upgrade::switching_protocols(&key, merged) {
            Ok(response) => response,
            Err(err) => {
                metrics::record_upgrade_failure();
                self.logger.in_scope(|| {
                    tracing::error!(error = %err, "Failed to build upgrade response");
                });
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        // Presence was checked by `validate`.
        let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let ctx = SessionContext {
            id: SessionId::new(),
            logger: self.logger.clone(),
            tracker: self.tracker.clone(),
            closed_hook: self.closed_hook.clone(),
        };
        tokio::spawn(session::run(ctx, on_upgrade, backend, parts));

        response
    }

    /// Copy of the inbound request head, rewritten for the backend.
    fn outbound_request(&self, inbound: &Parts) -> Request<()> {
        let mut outbound = Request::new(());
        *outbound.method_mut() = inbound.method.clone();
        *outbound.uri_mut() = inbound.uri.clone();
        *outbound.version_mut() = inbound.version;
        *outbound.headers_mut() = inbound.headers.clone();

        (self.director)(&mut outbound);

        let sanitized: &mut HeaderMap = outbound.headers_mut();
        headers::strip_dial_headers(sanitized);
        sanitized.remove(header::HOST);
        outbound
    }

    fn handle_error(&self, request: &Parts, err: ProxyError) -> Response<Body> {
        match &self.error_handler {
            Some(handler) => handler(request, &err),
            None => self.logger.in_scope(|| default_error_handler(request, &err)),
        }
    }
}

impl std::fmt::Debug for WebsocketProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketProxy")
            .field("error_handler", &self.error_handler.is_some())
            .field("closed_hook", &self.closed_hook.is_some())
            .field("logger", &self.logger)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

/// Host the client asked for, for log lines.
fn inbound_host(request: &Parts) -> String {
    request
        .headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| request.uri.host())
        .unwrap_or_default()
        .to_string()
}

/// Log the failure and answer 502 without a body.
fn default_error_handler(request: &Parts, err: &ProxyError) -> Response<Body> {
    tracing::error!(method = %request.method, uri = %request.uri, error = %err, "http: proxy error");
    StatusCode::BAD_GATEWAY.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn proxy() -> WebsocketProxy {
        let target = Url::parse("http://backend.internal:9000/base?token=abc").unwrap();
        WebsocketProxy::single_host(target)
    }

    fn inbound() -> Parts {
        Request::builder()
            .uri("/chat?room=1")
            .header(header::HOST, "proxy.example.com")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_EXTENSIONS, "permessage-deflate")
            .header(header::SEC_WEBSOCKET_PROTOCOL, "chat")
            .header(header::COOKIE, "session=1")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn outbound_request_is_rewritten_and_sanitized() {
        let outbound = proxy().outbound_request(&inbound());

        assert_eq!(
            outbound.uri().to_string(),
            "ws://backend.internal:9000/base/chat?token=abc&room=1"
        );
        for name in [
            header::HOST,
            header::CONNECTION,
            header::UPGRADE,
            header::SEC_WEBSOCKET_KEY,
            header::SEC_WEBSOCKET_VERSION,
            header::SEC_WEBSOCKET_EXTENSIONS,
        ] {
            assert!(!outbound.headers().contains_key(&name), "{name} was forwarded");
        }
        assert_eq!(outbound.headers()[header::SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(outbound.headers()[header::COOKIE], "session=1");
        assert_eq!(outbound.headers()[header::USER_AGENT], "");
    }

    #[test]
    fn outbound_request_keeps_user_agent() {
        let mut parts = inbound();
        parts
            .headers
            .insert(header::USER_AGENT, HeaderValue::from_static("client/1.0"));

        let outbound = proxy().outbound_request(&parts);
        assert_eq!(outbound.headers()[header::USER_AGENT], "client/1.0");
    }

    #[tokio::test]
    async fn refused_dial_answers_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Url::parse(&format!("http://{addr}")).unwrap();
        let proxy = WebsocketProxy::single_host(target);
        let request = Request::from_parts(inbound(), ());

        let response = proxy.serve(request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn custom_error_handler_is_used() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = Url::parse(&format!("http://{addr}")).unwrap();
        let handler: ErrorHandler =
            Arc::new(|_: &Parts, _: &ProxyError| StatusCode::SERVICE_UNAVAILABLE.into_response());
        let proxy = WebsocketProxy::single_host(target).with_error_handler(handler);

        let response = proxy.serve(Request::from_parts(inbound(), ())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn hostless_target_fails_as_malformed_dial() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let handler: ErrorHandler = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_: &Parts, err: &ProxyError| {
                *seen.lock().unwrap() = err.to_string();
                StatusCode::BAD_GATEWAY.into_response()
            })
        };
        let target = Url::parse("mailto:ops@example.com").unwrap();
        let proxy = WebsocketProxy::single_host(target).with_error_handler(handler);

        let response = proxy.serve(Request::from_parts(inbound(), ())).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            *seen.lock().unwrap(),
            "websocket: malformed target '/chat?room=1'"
        );
    }
}
