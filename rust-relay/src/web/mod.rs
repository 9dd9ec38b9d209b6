//! Web server module for the webhook relay.
//!
//! This module provides the single HTTP surface of the relay:
//! - `POST /` accepts a payment notification, checks the proxy's mTLS
//!   verdict, forwards the JSON body downstream and acknowledges
//! - `GET /?test=true` reports what the relay sees, for wiring checks
//!
//! See [`trust`] for the deployment invariant the trust check relies on.

pub mod diagnostics;
pub mod handlers;
pub mod trust;

use std::sync::Arc;

use anyhow::Result;
use axum::{routing::any, Router};
use tower_http::trace::TraceLayer;

use crate::forward::Forwarder;
use crate::journal::LogSink;
use crate::Config;

pub use diagnostics::DiagnosticsResponse;
pub use handlers::{acknowledge, webhook, ErrorResponse, Rejection, ACK_BODY, ACK_STATUS};
pub use trust::{TrustPolicy, TrustVerdict};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub forwarder: Forwarder,
    pub trust: Arc<TrustPolicy>,
    pub sink: Arc<dyn LogSink>,
}

impl AppState {
    /// Build the forwarder and trust policy from `config`.
    ///
    /// Also installs the process-wide panic hook that feeds failure traces
    /// into the relay log.
    pub fn new(config: Config, sink: Arc<dyn LogSink>) -> Result<Self> {
        let forwarder = Forwarder::new(&config)?;
        let trust = TrustPolicy::from_config(&config)?;
        handlers::install_panic_trace_hook();

        Ok(Self {
            config: Arc::new(config),
            forwarder,
            trust: Arc::new(trust),
            sink,
        })
    }
}

/// Build the router. Every method reaches the handler so it can answer 405 itself.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", any(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
