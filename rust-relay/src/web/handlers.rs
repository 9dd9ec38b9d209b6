//! Webhook endpoint handler.
//!
//! One linear pass per request:
//! 1. `?test=true` short-circuits to the diagnostics report
//! 2. Admission: method, body, trust header, JSON (4xx/403 on failure)
//! 3. Relay: forward downstream and log the outcome
//! 4. Acknowledge with `200` / `"200"` no matter how the relay went
//!
//! Once the trust check has passed the provider always gets the
//! acknowledgement, otherwise it would retry a notification that was
//! already accepted.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use anyhow::Result;
use axum::{
    body::{self, Body, Bytes},
    extract::{Request, State},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::forward::ForwardOutcome;
use crate::web::diagnostics;
use crate::web::trust::TrustVerdict;
use crate::web::AppState;

// =============================================================================
// Acknowledgement Policy
// =============================================================================

/// Status returned to the provider for every verified webhook.
pub const ACK_STATUS: StatusCode = StatusCode::OK;

/// Literal body returned to the provider for every verified webhook.
pub const ACK_BODY: &str = "200";

/// The only response a verified webhook can produce.
pub fn acknowledge() -> Response {
    (ACK_STATUS, ACK_BODY).into_response()
}

// =============================================================================
// Rejections
// =============================================================================

/// Reasons a request is turned away before anything is forwarded.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),

    #[error("Empty request body")]
    EmptyBody,

    #[error("mTLS verification failed: {0}")]
    Unverified(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Internal failure before the trust check could run.
    #[error("Failed to read request body: {0}")]
    BodyUnreadable(String),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Rejection::EmptyBody | Rejection::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Rejection::Unverified(_) | Rejection::BodyUnreadable(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Message shown to the caller. Internal details stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            Rejection::Unverified(_) | Rejection::BodyUnreadable(_) => {
                "mTLS verification required".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// JSON body for 4xx responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Rejection::MethodNotAllowed(_) = self {
            return status.into_response();
        }

        (
            status,
            Json(ErrorResponse {
                status: "error",
                message: self.public_message(),
            }),
        )
            .into_response()
    }
}

// =============================================================================
// Handler
// =============================================================================

/// A request that passed every admission check.
struct Admitted {
    payload: Value,
}

/// Webhook endpoint, mounted for every method.
pub async fn webhook(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    if diagnostics::is_requested(parts.uri.query()) {
        return diagnostics::report(&state, &parts);
    }

    let admitted = match admit(&state, &parts, body).await {
        Ok(admitted) => admitted,
        Err(rejection) => return rejection.into_response(),
    };

    // Trust check passed: from here on the answer is always the acknowledgement.
    match AssertUnwindSafe(relay(&state, &admitted)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let trace = Backtrace::force_capture();
            error!(error = ?e, "webhook_relay_error");
            state.sink.append(&format!(
                "Unexpected error after verification: {:?} | payload: {} | trace: {}",
                e, admitted.payload, trace
            ));
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            let trace = take_panic_trace()
                .unwrap_or_else(|| Backtrace::force_capture().to_string());
            error!(panic = %message, "webhook_relay_panic");
            state.sink.append(&format!(
                "Unexpected panic after verification: {} | payload: {} | trace: {}",
                message, admitted.payload, trace
            ));
        }
    }

    acknowledge()
}

/// Run every check that may turn the request away.
async fn admit(state: &AppState, parts: &Parts, body: Body) -> Result<Admitted, Rejection> {
    if parts.method != Method::POST {
        return Err(reject(state, parts, None, Rejection::MethodNotAllowed(parts.method.clone())));
    }

    let bytes = match body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return Err(reject(state, parts, None, Rejection::BodyUnreadable(e.to_string())));
        }
    };

    if bytes.is_empty() {
        return Err(reject(state, parts, Some(&bytes), Rejection::EmptyBody));
    }

    let presented = state.trust.presented(&parts.headers);
    match state.trust.evaluate(&parts.headers) {
        TrustVerdict::Verified => {}
        TrustVerdict::Missing | TrustVerdict::Rejected(_) => {
            return Err(reject(state, parts, Some(&bytes), Rejection::Unverified(presented)));
        }
    }

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => return Err(reject(state, parts, Some(&bytes), Rejection::from(e))),
    };

    info!(
        body_length = bytes.len(),
        client_verified = %presented,
        "webhook_received"
    );
    state.sink.append(&format!(
        "Received webhook data: {} (client verified: {})",
        String::from_utf8_lossy(&bytes),
        presented
    ));

    Ok(Admitted { payload })
}

/// Forward the payload downstream and log what came back.
async fn relay(state: &AppState, admitted: &Admitted) -> Result<()> {
    let outcome = state.forwarder.forward(&admitted.payload).await?;

    let elapsed_ms = outcome.elapsed().as_millis();
    match &outcome {
        ForwardOutcome::Completed { status, body, .. } => {
            state.sink.append(&format!(
                "n8n webhook response: HTTP {} ({} ms) {}",
                status, elapsed_ms, body
            ));
        }
        ForwardOutcome::Failed {
            error, timed_out, ..
        } => {
            let kind = if *timed_out { "timeout" } else { "transport" };
            state.sink.append(&format!(
                "n8n webhook error ({}, {} ms): {}",
                kind, elapsed_ms, error
            ));
        }
    }

    Ok(())
}

/// Log a rejection with enough context to debug it later.
fn reject(state: &AppState, parts: &Parts, body: Option<&Bytes>, rejection: Rejection) -> Rejection {
    let body = body
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();

    warn!(
        method = %parts.method,
        status_code = rejection.status().as_u16(),
        reason = %rejection,
        "webhook_rejected"
    );
    state.sink.append(&format!(
        "Rejected {} request ({}): {} | headers: {} | body: {}",
        parts.method,
        rejection.status().as_u16(),
        rejection,
        headers_to_json(&parts.headers),
        body
    ));

    rejection
}

/// Headers as a JSON object, lossy for non-UTF-8 values.
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    Value::Object(map)
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Remember where the last panic on each thread happened, with a backtrace.
///
/// The unwind is caught on the same thread right after the hook runs, so
/// the post-verification guard can pick the trace up. The previous hook
/// still runs.
pub fn install_panic_trace_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown location".to_string());
            let trace = format!("panicked at {}\n{}", location, Backtrace::force_capture());
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_acknowledgement_is_literal_200() {
        assert_eq!(ACK_STATUS, StatusCode::OK);
        assert_eq!(ACK_BODY, "200");
        assert_eq!(acknowledge().status(), StatusCode::OK);
    }

    #[test]
    fn test_rejection_statuses() {
        assert_eq!(Rejection::MethodNotAllowed(Method::GET).status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(Rejection::EmptyBody.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Rejection::Unverified("NONE".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Rejection::BodyUnreadable("reset".into()).status(), StatusCode::FORBIDDEN);

        let json_error = serde_json::from_str::<Value>("{").unwrap_err();
        assert_eq!(Rejection::from(json_error).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_public_message_hides_internal_detail() {
        let rejection = Rejection::BodyUnreadable("connection reset by peer".into());
        assert_eq!(rejection.public_message(), "mTLS verification required");

        let rejection = Rejection::Unverified("FAILED:self signed".into());
        assert_eq!(rejection.public_message(), "mTLS verification required");
    }

    #[test]
    fn test_invalid_json_message_includes_reason() {
        let json_error = serde_json::from_str::<Value>("{\"id\":").unwrap_err();
        let reason = json_error.to_string();
        let message = Rejection::from(json_error).public_message();
        assert!(message.starts_with("Invalid JSON: "));
        assert!(message.contains(&reason));
    }

    #[test]
    fn test_headers_to_json_joins_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let json = headers_to_json(&headers);
        assert_eq!(json["x-forwarded-for"], "10.0.0.1, 10.0.0.2");
        assert_eq!(json["content-type"], "application/json");
    }

    #[test]
    fn test_panic_trace_hook_records_location() {
        install_panic_trace_hook();
        let _ = take_panic_trace();

        let result = std::panic::catch_unwind(|| panic!("boom"));
        assert!(result.is_err());

        let trace = take_panic_trace().unwrap();
        assert!(trace.starts_with("panicked at "));
        assert!(trace.contains("handlers.rs"));
        assert!(take_panic_trace().is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
