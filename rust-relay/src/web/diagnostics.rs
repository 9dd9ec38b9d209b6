//! `?test=true` diagnostics report.
//!
//! Used to check the proxy wiring: shows what the relay sees of the trust
//! header without enforcing it and without forwarding anything.

use axum::{
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::journal;
use crate::web::handlers::headers_to_json;
use crate::web::AppState;

/// Diagnostics response.
#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub time: String,
    pub version: &'static str,
    pub runtime: &'static str,
    pub runtime_version: &'static str,
    pub mtls_status: MtlsStatus,
    pub server_info: ServerInfo,
}

/// What the relay sees of the proxy's verification result.
#[derive(Debug, Serialize)]
pub struct MtlsStatus {
    pub client_verified: String,
    pub is_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub request_method: String,
    pub request_uri: String,
    pub headers: Value,
}

/// Whether the query string asks for diagnostics (`test=true`).
pub fn is_requested(query: Option<&str>) -> bool {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).any(|(k, v)| k == "test" && v == "true"))
        .unwrap_or(false)
}

/// Build the report and note the access in the relay log.
pub fn report(state: &AppState, parts: &Parts) -> Response {
    let mtls_status = MtlsStatus {
        client_verified: state.trust.presented(&parts.headers),
        is_verified: state.trust.evaluate(&parts.headers).is_verified(),
    };
    let headers = headers_to_json(&parts.headers);

    info!(
        method = %parts.method,
        is_verified = mtls_status.is_verified,
        "diagnostics_requested"
    );
    state.sink.append(&format!(
        "Test script accessed | mTLS Status: {} | Headers: {}",
        serde_json::to_string(&mtls_status).unwrap_or_default(),
        headers
    ));

    let response = DiagnosticsResponse {
        status: "success",
        message: "mTLS relay diagnostics",
        time: journal::timestamp(),
        version: env!("CARGO_PKG_VERSION"),
        runtime: "rust",
        runtime_version: env!("EFI_RELAY_RUSTC_VERSION"),
        mtls_status,
        server_info: ServerInfo {
            request_method: parts.method.to_string(),
            request_uri: parts.uri.to_string(),
            headers,
        },
    };

    match serde_json::to_string_pretty(&response) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "diagnostics_serialize_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_requested() {
        assert!(is_requested(Some("test=true")));
        assert!(is_requested(Some("foo=bar&test=true")));
        assert!(!is_requested(Some("test=false")));
        assert!(!is_requested(Some("test=TRUE")));
        assert!(!is_requested(Some("")));
        assert!(!is_requested(None));
    }
}
