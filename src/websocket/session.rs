//! Post-upgrade phase of a proxied connection.
//!
//! # Responsibilities
//! - Complete the inbound upgrade and wrap the IO as a server-side WebSocket
//! - Run both relay directions and wait for the first to finish
//! - Tear down both connections, then run the closed hook
//!
//! # Data Flow
//! ```text
//! OnUpgrade ─▶ client WS ─┬─ replicate(client → backend) ─┐
//!                         └─ replicate(backend → client) ─┴─▶ first result
//!                                                              ─▶ stop other
//!                                                              ─▶ close client, close backend
//!                                                              ─▶ closed hook
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::lifecycle::{SessionId, SessionTracker};
use crate::observability::logging::Logger;
use crate::observability::metrics;
use crate::websocket::dialer::BackendStream;
use crate::websocket::error::RelayError;
use crate::websocket::relay::{self, Direction};

/// Upper bound for flushing and shutting down one connection at teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Called once both connections of a session are closed, with the original
/// inbound request and the client's underlying transport.
///
/// By then the client's final frames are flushed and its write half is shut
/// down, so the peer has seen end-of-stream. The socket itself is released
/// when the hook returns; the transport is for identification only and must
/// not be read from or written to.
pub type ConnectionClosedHook = Arc<dyn Fn(&Parts, &Upgraded) + Send + Sync>;

/// Per-session state handed over by the proxy.
pub(crate) struct SessionContext {
    pub id: SessionId,
    pub logger: Logger,
    pub tracker: SessionTracker,
    pub closed_hook: Option<ConnectionClosedHook>,
}

/// What the relay phase leaves behind for teardown.
pub(crate) struct RelayOutcome<C, B> {
    pub first: Option<(Direction, RelayError)>,
    pub client: Option<WebSocketStream<C>>,
    pub backend: Option<WebSocketStream<B>>,
}

/// Drive one session from the pending upgrade to the closed hook.
pub(crate) async fn run(
    ctx: SessionContext,
    on_upgrade: OnUpgrade,
    backend: BackendStream,
    request: Parts,
) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            metrics::record_upgrade_failure();
            ctx.logger.in_scope(|| {
                tracing::warn!(session = %ctx.id, error = %err, "Error while upgrading connection");
            });
            return;
        }
    };

    let client = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
    let guard = ctx.tracker.track(ctx.id);
    ctx.logger.in_scope(|| {
        tracing::debug!(session = %ctx.id, path = %request.uri.path(), "Session established");
    });

    let outcome = relay(ctx.id, &ctx.logger, client, backend).await;
    teardown(&ctx, outcome, &request).await;
    drop(guard);
}

/// Run both directions until the first one reports, then stop the other
/// and reunite each connection from its halves.
pub(crate) async fn relay<C, B>(
    id: SessionId,
    logger: &Logger,
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
) -> RelayOutcome<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_sink, client_stream) = client.split();
    let (backend_sink, backend_stream) = backend.split();

    let (stop_tx, stop_rx) = watch::channel(false);
    let (to_backend_tx, to_backend_rx) = oneshot::channel();
    let (to_client_tx, to_client_rx) = oneshot::channel();

    let to_backend = tokio::spawn(relay::replicate(
        Direction::ClientToBackend,
        client_stream,
        backend_sink,
        to_backend_tx,
        stop_rx.clone(),
    ));
    let to_client = tokio::spawn(relay::replicate(
        Direction::BackendToClient,
        backend_stream,
        client_sink,
        to_client_tx,
        stop_rx,
    ));

    let first = tokio::select! {
        Ok(err) = to_backend_rx => Some((Direction::ClientToBackend, err)),
        Ok(err) = to_client_rx => Some((Direction::BackendToClient, err)),
        else => None,
    };

    if let Some((direction, err)) = &first {
        if should_log(err) {
            logger.in_scope(|| {
                tracing::warn!(session = %id, %direction, error = %err, "Relay terminated");
            });
        }
    }

    let _ = stop_tx.send(true);
    let (to_backend, to_client) = tokio::join!(to_backend, to_client);

    let (client, backend) = match (to_backend, to_client) {
        (Ok((client_stream, backend_sink)), Ok((backend_stream, client_sink))) => (
            client_stream.reunite(client_sink).ok(),
            backend_stream.reunite(backend_sink).ok(),
        ),
        (to_backend, to_client) => {
            for err in [to_backend.err(), to_client.err()].into_iter().flatten() {
                logger.in_scope(|| tracing::error!(session = %id, error = %err, "Relay task failed"));
            }
            (None, None)
        }
    };

    RelayOutcome {
        first,
        client,
        backend,
    }
}

/// Everything except an abnormal closure is worth a log line.
pub(crate) fn should_log(err: &RelayError) -> bool {
    err.close_code() != Some(CloseCode::Abnormal)
}

async fn teardown<B>(ctx: &SessionContext, outcome: RelayOutcome<TokioIo<Upgraded>, B>, request: &Parts)
where
    B: AsyncRead + AsyncWrite + Unpin,
{
    let RelayOutcome {
        mut client,
        backend,
        ..
    } = outcome;

    if let Some(client) = client.as_mut() {
        close_transport(client).await;
    }
    if let Some(mut backend) = backend {
        close_transport(&mut backend).await;
    }

    // `client` is dropped, closing the socket, when teardown returns.
    match (&ctx.closed_hook, &client) {
        (Some(hook), Some(client)) => hook(request, client.get_ref().inner()),
        (Some(_), None) => ctx.logger.in_scope(|| {
            tracing::warn!(session = %ctx.id, "Client transport lost, closed hook skipped");
        }),
        (None, _) => {}
    }

    ctx.logger.in_scope(|| tracing::debug!(session = %ctx.id, "Session closed"));
}

/// Flush anything the codec still holds (such as a close reply), then shut
/// the transport down.
async fn close_transport<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let close = async {
        let _ = ws.flush().await;
        let _ = ws.get_mut().shutdown().await;
    };
    let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, close).await;
}
