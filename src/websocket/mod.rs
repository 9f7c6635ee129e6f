//! WebSocket reverse proxying.
//!
//! # Responsibilities
//! - Rewrite and sanitize the handshake before dialing the backend
//! - Complete the client's upgrade with the backend's negotiated headers
//! - Relay messages in both directions until either side closes
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Backend
//!                                       │
//!               proxy.rs ─▶ director.rs ─▶ dialer.rs
//!                  │
//!                  ├─▶ upgrade.rs (101 or backend passthrough)
//!                  └─▶ session.rs ─▶ relay.rs × 2
//! ```
//!
//! # Design Decisions
//! - Messages are re-framed, never forwarded as raw bytes
//! - Hop-by-hop and handshake headers never cross from one leg to the other
//! - Close codes are translated; local-only codes never reach the wire

pub mod dialer;
pub mod director;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod upgrade;

pub use dialer::{BackendStream, DefaultDialer, Dialer, HandshakeResponse};
pub use director::{single_host_director, Director};
pub use error::{CloseSignal, DialError, ProxyError, RelayError, UpgradeError};
pub use proxy::{ErrorHandler, WebsocketProxy};
pub use relay::Direction;
pub use session::ConnectionClosedHook;
pub use upgrade::PresetHeaders;
