//! Error types for the WebSocket proxy.

use std::fmt;
use std::io;
use std::time::Duration;

use axum::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::websocket::dialer::HandshakeResponse;

/// Failure to open the backend connection.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The backend answered the handshake with a non-101 HTTP response.
    #[error("websocket: bad handshake (backend answered {})", .response.status())]
    Handshake { response: HandshakeResponse },

    /// The TCP connection or TLS session could not be opened.
    #[error("websocket: dial failed: {0}")]
    Connect(#[from] io::Error),

    /// The connection broke before a complete response head arrived.
    #[error("websocket: handshake failed: {0}")]
    Http(#[from] hyper::Error),

    /// The backend answered 101 without completing the WebSocket handshake.
    #[error("websocket: bad handshake: {0}")]
    Protocol(&'static str),

    #[error("websocket: malformed target '{0}'")]
    InvalidTarget(String),

    #[error("websocket: invalid handshake request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("websocket: TLS configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("websocket: dial timed out after {0:?}")]
    Timeout(Duration),
}

impl DialError {
    /// The backend's HTTP response, for soft failures.
    pub fn response(&self) -> Option<&HandshakeResponse> {
        match self {
            DialError::Handshake { response } => Some(response),
            _ => None,
        }
    }
}

/// Errors handed to the proxy's error handler.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Dial(#[from] DialError),

    /// The backend's handshake response could not be relayed to the client.
    #[error("websocket: failed to forward backend response: {0}")]
    Forward(#[from] axum::http::Error),
}

/// Rejection of an inbound request that cannot be upgraded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeError {
    #[error("websocket: the client is not using the websocket protocol: 'upgrade' token not found in 'Connection' header")]
    MissingConnectionUpgrade,

    #[error("websocket: the client is not using the websocket protocol: 'websocket' token not found in 'Upgrade' header")]
    MissingUpgradeWebsocket,

    #[error("websocket: the client is not using the websocket protocol: request method is not GET")]
    MethodNotGet,

    #[error("websocket: unsupported version: 13 not found in 'Sec-Websocket-Version' header")]
    UnsupportedVersion,

    #[error("websocket: not a websocket handshake: 'Sec-WebSocket-Key' header is missing")]
    MissingKey,

    #[error("websocket: connection does not support upgrades")]
    UpgradeUnavailable,
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeError::MethodNotGet => StatusCode::METHOD_NOT_ALLOWED,
            UpgradeError::UpgradeUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A close code and text, read off the wire or synthesized for a dead transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSignal {
    pub code: CloseCode,
    pub text: String,
}

impl CloseSignal {
    pub fn new(code: CloseCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl fmt::Display for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket: close {}", u16::from(self.code))?;
        if !self.text.is_empty() {
            write!(f, " {}", self.text)?;
        }
        Ok(())
    }
}

/// Why one relay direction stopped.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Close(CloseSignal),

    #[error(transparent)]
    Transport(#[from] WsError),
}

impl RelayError {
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            RelayError::Close(signal) => Some(signal.code),
            RelayError::Transport(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_signal_display() {
        let signal = CloseSignal::new(CloseCode::Away, "shutting down");
        assert_eq!(signal.to_string(), "websocket: close 1001 shutting down");
        assert_eq!(
            CloseSignal::new(CloseCode::Status, "").to_string(),
            "websocket: close 1005"
        );
    }

    #[test]
    fn upgrade_statuses() {
        assert_eq!(UpgradeError::MethodNotGet.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(UpgradeError::MissingKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            UpgradeError::UpgradeUnavailable.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
