//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router that hands every request to the WebSocket proxy
//! - Wire up middleware (request ID, tracing)
//! - Bind server to listener
//! - Stop accepting on shutdown, then give live sessions a grace period

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::websocket::WebsocketProxy;

/// HTTP server for the WebSocket proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    proxy: WebsocketProxy,
}

impl HttpServer {
    /// Create a new HTTP server proxying to `config.upstream`.
    pub fn new(config: ProxyConfig) -> Result<Self, url::ParseError> {
        let proxy = WebsocketProxy::from_config(&config.upstream)?;
        Ok(Self::with_proxy(config, proxy))
    }

    /// Create a server around an already configured proxy.
    pub fn with_proxy(config: ProxyConfig, proxy: WebsocketProxy) -> Self {
        let router = Self::build_router(proxy.clone());
        Self {
            router,
            config,
            proxy,
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(proxy: WebsocketProxy) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(proxy)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server until `shutdown` fires, then wait for live sessions.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            target = %self.config.upstream.target,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");

        let tracker = self.proxy.tracker();
        let grace = Duration::from_secs(self.config.lifecycle.shutdown_grace_secs);
        if !tracker.wait_for_drain(grace).await {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Sessions still open after grace period"
            );
        }
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn proxy(&self) -> &WebsocketProxy {
        &self.proxy
    }
}

async fn proxy_handler(State(proxy): State<WebsocketProxy>, request: Request<Body>) -> Response {
    proxy.serve(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use tower::ServiceExt;

    fn server_for_closed_port() -> HttpServer {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = ProxyConfig::default();
        config.upstream.target = format!("http://{addr}");
        HttpServer::new(config).unwrap()
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway_with_request_id() {
        let server = server_for_closed_port();
        let request = Request::builder()
            .uri("/anything")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();

        let response = server.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn rejects_invalid_target() {
        let mut config = ProxyConfig::default();
        config.upstream.target = "not a url".to_string();
        assert!(HttpServer::new(config).is_err());
    }
}
