//! Downstream forwarding.
//!
//! One POST per accepted webhook, no retries. The outcome is reported back
//! to the handler for logging only; it never changes what the payment
//! provider sees.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::{header, Client};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::Config;

/// Result of the single downstream call.
#[derive(Debug, Clone)]
pub enum ForwardOutcome {
    /// The downstream answered, with any status.
    Completed {
        status: u16,
        body: String,
        elapsed: Duration,
    },
    /// No usable answer: connect error, TLS failure, timeout, broken body.
    Failed {
        error: String,
        timed_out: bool,
        elapsed: Duration,
    },
}

impl ForwardOutcome {
    /// Completed with a 2xx status.
    pub fn is_success(&self) -> bool {
        matches!(self, ForwardOutcome::Completed { status, .. } if (200..300).contains(status))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ForwardOutcome::Completed { status, .. } => Some(*status),
            ForwardOutcome::Failed { .. } => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            ForwardOutcome::Completed { elapsed, .. } | ForwardOutcome::Failed { elapsed, .. } => {
                *elapsed
            }
        }
    }
}

/// HTTP client bound to the configured downstream URL.
#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl Forwarder {
    /// Build the shared client.
    ///
    /// Fails if the downstream URL is not an absolute http(s) URL.
    pub fn new(config: &Config) -> Result<Self> {
        let url = Url::parse(&config.downstream_url)
            .with_context(|| format!("Invalid DOWNSTREAM_URL: {}", config.downstream_url))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("DOWNSTREAM_URL must use http or https, got {}", url.scheme());
        }

        if config.downstream_insecure_skip_tls_verify {
            warn!(
                downstream_url = %url,
                "downstream_tls_verification_disabled"
            );
        }

        let client = Client::builder()
            .timeout(config.forward_timeout)
            .danger_accept_invalid_certs(config.downstream_insecure_skip_tls_verify)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            timeout: config.forward_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST the payload downstream and report what happened.
    pub async fn forward(&self, payload: &Value) -> Result<ForwardOutcome> {
        let body = serde_json::to_vec(payload).context("Failed to serialize payload")?;

        info!(
            downstream_url = %self.url,
            body_length = body.len(),
            timeout_seconds = self.timeout.as_secs_f64(),
            "forward_starting"
        );

        let started = Instant::now();
        let response = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;

        let outcome = match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match resp.text().await {
                    Ok(body) => ForwardOutcome::Completed {
                        status,
                        body,
                        elapsed: started.elapsed(),
                    },
                    Err(e) => ForwardOutcome::Failed {
                        error: format!("HTTP {} with unreadable body: {}", status, e),
                        timed_out: e.is_timeout(),
                        elapsed: started.elapsed(),
                    },
                }
            }
            Err(e) => ForwardOutcome::Failed {
                error: e.to_string(),
                timed_out: e.is_timeout(),
                elapsed: started.elapsed(),
            },
        };

        match &outcome {
            ForwardOutcome::Completed { status, elapsed, .. } => info!(
                status_code = status,
                is_success = outcome.is_success(),
                elapsed_ms = elapsed.as_millis() as u64,
                "forward_complete"
            ),
            ForwardOutcome::Failed {
                error,
                timed_out,
                elapsed,
            } => warn!(
                error = %error,
                timed_out = timed_out,
                elapsed_ms = elapsed.as_millis() as u64,
                "forward_failed"
            ),
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{http::StatusCode, routing::post, Router};
    use serde_json::json;

    async fn spawn_downstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/hook", addr)
    }

    fn config_for(url: String, timeout: Duration) -> Config {
        Config {
            downstream_url: url,
            forward_timeout: timeout,
            ..Config::default()
        }
    }

    #[test]
    fn test_rejects_invalid_url() {
        let config = config_for("not a url".to_string(), Duration::from_secs(1));
        assert!(Forwarder::new(&config).is_err());
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let config = config_for("ftp://example.com/hook".to_string(), Duration::from_secs(1));
        assert!(Forwarder::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_forward_sends_json_with_content_type() {
        let app = Router::new().route(
            "/hook",
            post(|headers: axum::http::HeaderMap, body: String| async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                format!("{}|{}", content_type, body)
            }),
        );
        let url = spawn_downstream(app).await;
        let forwarder = Forwarder::new(&config_for(url, Duration::from_secs(5))).unwrap();

        let outcome = forwarder
            .forward(&json!({"id": 123, "amount": 50.0}))
            .await
            .unwrap();

        assert!(outcome.is_success());
        match outcome {
            ForwardOutcome::Completed { status, body, .. } => {
                assert_eq!(status, 200);
                let (content_type, echoed) = body.split_once('|').unwrap();
                assert_eq!(content_type, "application/json");
                let echoed: Value = serde_json::from_str(echoed).unwrap();
                assert_eq!(echoed, json!({"id": 123, "amount": 50.0}));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_reports_server_error_as_completed() {
        let app = Router::new().route(
            "/hook",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let url = spawn_downstream(app).await;
        let forwarder = Forwarder::new(&config_for(url, Duration::from_secs(5))).unwrap();

        let outcome = forwarder.forward(&json!({"id": 1})).await.unwrap();

        assert!(!outcome.is_success());
        assert_eq!(outcome.status(), Some(502));
    }

    #[tokio::test]
    async fn test_forward_times_out() {
        let app = Router::new().route(
            "/hook",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let url = spawn_downstream(app).await;
        let forwarder = Forwarder::new(&config_for(url, Duration::from_millis(200))).unwrap();

        let outcome = forwarder.forward(&json!({"id": 1})).await.unwrap();

        match outcome {
            ForwardOutcome::Failed { timed_out, .. } => assert!(timed_out),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_connection_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("http://{}/hook", addr);
        let forwarder = Forwarder::new(&config_for(url, Duration::from_secs(2))).unwrap();

        let outcome = forwarder.forward(&json!({"id": 1})).await.unwrap();

        assert!(!outcome.is_success());
        assert_eq!(outcome.status(), None);
    }
}
