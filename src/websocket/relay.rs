//! Frame relay between the two legs of a proxied connection.
//!
//! # Responsibilities
//! - Forward messages from one leg to the other, in order, one at a time
//! - Forward pings and pongs the moment they arrive
//! - Translate the terminating condition into a close frame for the other leg
//!
//! # Data Flow
//! ```text
//! source ──next()──▶ Reading ──msg──▶ Forwarding ──send()──▶ destination
//!                       │                  │
//!                       └──error──▶ Done ◀─┘
//! ```
//!
//! # Design Decisions
//! - One task per direction; each owns one read half and one write half
//! - The result goes out on a oneshot so the task never waits for a consumer
//! - Abnormal closure (1006) and TLS failure (1015) never go on the wire

use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::observability::metrics;
use crate::websocket::error::{CloseSignal, RelayError};

/// Upper bound for the best-effort close frame sent after a direction ends.
const CLOSE_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest close reason that fits a control frame next to the 2-byte code.
const MAX_CLOSE_REASON: usize = 123;

/// Which way a relay task copies messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client to backend"),
            Direction::BackendToClient => f.write_str("backend to client"),
        }
    }
}

enum Step {
    Stopped,
    Read(RelayError),
    Write(WsError),
}

/// Copy messages from `src` to `dst` until either side fails.
///
/// The terminating error is sent on `result` exactly once. When `stop`
/// changes (or its sender goes away) the loop exits without reporting.
/// Both halves are handed back so the caller can close the connections.
pub async fn replicate<R, W>(
    direction: Direction,
    mut src: R,
    mut dst: W,
    result: oneshot::Sender<RelayError>,
    mut stop: watch::Receiver<bool>,
) -> (R, W)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let step = loop {
        let next = tokio::select! {
            _ = stop.changed() => break Step::Stopped,
            next = src.next() => next,
        };

        let message = match next {
            Some(Ok(Message::Close(frame))) => break Step::Read(RelayError::Close(close_signal(frame))),
            Some(Ok(message)) => message,
            Some(Err(err)) => break Step::Read(classify(err)),
            None => {
                break Step::Read(RelayError::Close(CloseSignal::new(
                    CloseCode::Abnormal,
                    "unexpected EOF",
                )))
            }
        };

        let control = matches!(message, Message::Ping(_) | Message::Pong(_));
        let forwarded = tokio::select! {
            _ = stop.changed() => break Step::Stopped,
            forwarded = dst.send(message) => forwarded,
        };

        match forwarded {
            Ok(()) => {
                if !control {
                    metrics::record_message(direction);
                }
            }
            // Control frames are answered from the read side, so a failure
            // forwarding one ends the loop like a read error would.
            Err(err) if control => break Step::Read(RelayError::Transport(err)),
            Err(err) => break Step::Write(err),
        }
    };

    match step {
        Step::Stopped => {}
        Step::Write(err) => {
            let _ = result.send(RelayError::Transport(err));
        }
        Step::Read(err) => {
            let frame = close_frame_for(&err);
            let _ = result.send(err);
            if let Some(frame) = frame {
                let close = dst.send(Message::Close(Some(frame)));
                if let Err(err) = tokio::time::timeout(CLOSE_FORWARD_TIMEOUT, close)
                    .await
                    .unwrap_or_else(|_| Err(WsError::Io(ErrorKind::TimedOut.into())))
                {
                    tracing::trace!(%direction, error = %err, "Close frame not forwarded");
                }
            }
        }
    }

    (src, dst)
}

/// The close frame to forward after a read-side failure, if any.
pub fn close_frame_for(err: &RelayError) -> Option<CloseFrame> {
    let default = CloseFrame {
        code: CloseCode::Normal,
        reason: truncate_reason(&err.to_string()).to_owned().into(),
    };

    match err {
        RelayError::Close(signal) => match signal.code {
            CloseCode::Status => Some(default),
            // Local-only codes: drop the transport without a close frame.
            CloseCode::Abnormal | CloseCode::Tls => None,
            code => Some(CloseFrame {
                code,
                reason: truncate_reason(&signal.text).to_owned().into(),
            }),
        },
        RelayError::Transport(_) => Some(default),
    }
}

fn close_signal(frame: Option<CloseFrame>) -> CloseSignal {
    match frame {
        Some(frame) => CloseSignal::new(frame.code, frame.reason.as_str()),
        None => CloseSignal::new(CloseCode::Status, ""),
    }
}

fn classify(err: WsError) -> RelayError {
    match err {
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            RelayError::Close(CloseSignal::new(CloseCode::Abnormal, "unexpected EOF"))
        }
        WsError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
            RelayError::Close(CloseSignal::new(CloseCode::Abnormal, io.to_string()))
        }
        other => RelayError::Transport(other),
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
