//! Backend dialing.
//!
//! # Responsibilities
//! - Open the backend connection for a rewritten target URI (TLS for `wss`)
//! - Send the WebSocket handshake with the sanitized outbound headers
//! - Separate hard failures from backends that answered with plain HTTP
//!
//! # Design Decisions
//! - The handshake runs on hyper's HTTP/1 client, so a non-101 answer is read
//!   like any other response, body included
//! - Cancellation is drop-based: dropping the dial future aborts the dial
//! - The whole dial is bounded by a timeout so a silent backend cannot pin a handler

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{self, HeaderMap};
use axum::http::{Method, Request, StatusCode, Uri};
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::websocket::error::DialError;
use crate::websocket::headers;

/// A dialed backend connection.
pub type BackendStream = WebSocketStream<TokioIo<Upgraded>>;

/// The HTTP response a backend sent during the handshake.
pub type HandshakeResponse = axum::http::Response<Option<Vec<u8>>>;

/// Most bytes of a rejection body kept for the client.
pub const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Opens WebSocket connections to backends.
pub trait Dialer: Send + Sync {
    /// Dial `target` with `headers` added to the handshake request.
    ///
    /// On success the 101 response is returned with the stream. A backend
    /// that answers with any other status yields [`DialError::Handshake`].
    fn dial<'a>(
        &'a self,
        target: &'a Uri,
        headers: HeaderMap,
    ) -> BoxFuture<'a, Result<(BackendStream, HandshakeResponse), DialError>>;
}

/// Dialer for `ws` and `wss` targets, bounded by a timeout.
///
/// `wss` backends are verified against the bundled webpki roots.
#[derive(Debug, Clone)]
pub struct DefaultDialer {
    connect_timeout: Duration,
}

impl DefaultDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(
        &self,
        target: &Uri,
        headers: HeaderMap,
    ) -> Result<(BackendStream, HandshakeResponse), DialError> {
        match tokio::time::timeout(self.connect_timeout, establish(target, headers)).await {
            Ok(dialed) => dialed,
            Err(_) => Err(DialError::Timeout(self.connect_timeout)),
        }
    }
}

impl Default for DefaultDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Dialer for DefaultDialer {
    fn dial<'a>(
        &'a self,
        target: &'a Uri,
        headers: HeaderMap,
    ) -> BoxFuture<'a, Result<(BackendStream, HandshakeResponse), DialError>> {
        Box::pin(self.connect(target, headers))
    }
}

async fn establish(
    target: &Uri,
    headers: HeaderMap,
) -> Result<(BackendStream, HandshakeResponse), DialError> {
    let invalid = || DialError::InvalidTarget(target.to_string());
    let secure = match target.scheme_str() {
        Some("ws") => false,
        Some("wss") => true,
        _ => return Err(invalid()),
    };
    let host = target
        .host()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(invalid)?;
    let port = target.port_u16().unwrap_or(if secure { 443 } else { 80 });

    let key = generate_key();
    let request = handshake_request(target, &headers, &key)?;

    let tcp = TcpStream::connect((host, port)).await?;
    if secure {
        let name = ServerName::try_from(host).map_err(|_| invalid())?.to_owned();
        let tls = TlsConnector::from(webpki_client_config()?)
            .connect(name, tcp)
            .await?;
        handshake(tls, request, &key).await
    } else {
        handshake(tcp, request, &key).await
    }
}

fn handshake_request(
    target: &Uri,
    headers: &HeaderMap,
    key: &str,
) -> Result<Request<Empty<Bytes>>, DialError> {
    let authority = target
        .authority()
        .ok_or_else(|| DialError::InvalidTarget(target.to_string()))?;
    let path = target.path_and_query().map_or("/", |path| path.as_str());

    let mut request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::HOST, authority.as_str())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .body(Empty::new())?;

    for (name, value) in headers {
        request.headers_mut().append(name.clone(), value.clone());
    }
    Ok(request)
}

/// Run the HTTP/1 upgrade handshake over an established transport.
async fn handshake<S>(
    io: S,
    request: Request<Empty<Bytes>>,
    key: &str,
) -> Result<(BackendStream, HandshakeResponse), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            tracing::debug!(error = %err, "Backend handshake connection failed");
        }
    });

    let mut response = sender.send_request(request).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = response.into_parts();
        let body = read_capped(body, MAX_REJECTION_BODY).await;
        return Err(DialError::Handshake {
            response: HandshakeResponse::from_parts(parts, body),
        });
    }

    let accepted = response.headers();
    if !headers::has_token(accepted, &header::UPGRADE, "websocket") {
        return Err(DialError::Protocol("'websocket' token not found in 'Upgrade' header"));
    }
    if !headers::has_token(accepted, &header::CONNECTION, "upgrade") {
        return Err(DialError::Protocol("'upgrade' token not found in 'Connection' header"));
    }
    if accepted
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .map_or(true, |accept| accept.as_bytes() != derive_accept_key(key.as_bytes()).as_bytes())
    {
        return Err(DialError::Protocol("'Sec-WebSocket-Accept' does not match the key"));
    }

    let upgraded = hyper::upgrade::on(&mut response).await?;
    let (parts, _) = response.into_parts();
    let stream = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
    Ok((stream, HandshakeResponse::from_parts(parts, None)))
}

/// Collect up to `limit` body bytes. A body cut short by the backend keeps
/// whatever arrived.
async fn read_capped(mut body: Incoming, limit: usize) -> Option<Vec<u8>> {
    let mut collected = Vec::new();
    while collected.len() < limit {
        let Some(Ok(frame)) = body.frame().await else {
            break;
        };
        if let Ok(data) = frame.into_data() {
            let room = limit - collected.len();
            collected.extend_from_slice(&data[..data.len().min(room)]);
        }
    }
    (!collected.is_empty()).then_some(collected)
}

fn webpki_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(Arc::new(config))
}
