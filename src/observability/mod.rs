//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy and relay tasks produce:
//!     → logging.rs (structured log events, injectable Logger)
//!     → metrics.rs (dial failures, sessions, relayed messages)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging via `tracing`; every session carries a session ID
//! - Metrics go through the `metrics` facade and cost nothing without an exporter

pub mod logging;
pub mod metrics;
