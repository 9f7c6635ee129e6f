//! HTTP front end.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → WebsocketProxy::serve (every path, every method)
//!     → 101 + relay session, or the backend's/handler's response
//! ```

pub mod server;

pub use server::HttpServer;
