//! EFI Relay - mTLS-gated payment webhook relay.
//!
//! Receives payment notifications behind a TLS-terminating proxy that
//! performs the client certificate handshake, and relays the JSON body to a
//! workflow endpoint.
//!
//! ## Architecture
//!
//! ```text
//! Provider → mTLS proxy (sets X-Client-Verified) → Relay → Downstream
//!                                                    ↓
//!                                              webhook.log
//! ```
//!
//! The provider always receives `200` once the trust check has passed,
//! whatever the downstream does.

pub mod config;
pub mod forward;
pub mod journal;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use forward::{ForwardOutcome, Forwarder};
pub use journal::{FileLogSink, LogSink, MemoryLogSink};
pub use web::{build_router, AppState};
