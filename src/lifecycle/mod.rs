//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain relay sessions → Exit
//!
//! Sessions (sessions.rs):
//!     Upgrade completed → track() → relay runs → guard dropped
//! ```
//!
//! # Design Decisions
//! - Upgraded connections leave hyper's bookkeeping, so sessions are counted here
//! - Shutdown has a deadline: sessions still open after it are dropped

pub mod sessions;
pub mod shutdown;

pub use sessions::{SessionGuard, SessionId, SessionTracker};
pub use shutdown::Shutdown;
