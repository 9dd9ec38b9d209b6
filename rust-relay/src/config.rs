//! Configuration module for environment variable parsing.
//!
//! Everything the relay needs to know about its surroundings (downstream
//! target, log file location and permissions, trust header, TLS policy)
//! is read once at startup. Malformed values fall back to defaults with a
//! warning so a typo never takes the webhook endpoint down.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Default forward target for payment notifications.
pub const DEFAULT_DOWNSTREAM_URL: &str = "https://back.bcaju.ai/v1/efi_padrao";

/// Default location of the append-only relay log.
pub const DEFAULT_LOG_FILE: &str = "/var/log/efibank/webhook.log";

/// Header injected by the TLS-terminating proxy after the client handshake.
pub const DEFAULT_TRUST_HEADER: &str = "X-Client-Verified";

/// Header value the proxy writes when the client certificate verified.
pub const DEFAULT_TRUST_SENTINEL: &str = "SUCCESS";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// URL every accepted webhook body is POSTed to
    pub downstream_url: String,

    /// Whole-request timeout for the downstream call
    pub forward_timeout: Duration,

    /// Skip downstream certificate verification. Debug use only.
    pub downstream_insecure_skip_tls_verify: bool,

    /// Name of the proxy-injected trust header
    pub trust_header: String,

    /// Exact value of the trust header that means "verified"
    pub trust_sentinel: String,

    /// Relay log file
    pub log_file: PathBuf,

    /// Mode for directories created on the way to the log file (unix)
    pub log_dir_mode: u32,

    /// Mode for a newly created log file (unix)
    pub log_file_mode: u32,

    /// Upper bound on the inbound body read
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            downstream_url: DEFAULT_DOWNSTREAM_URL.to_string(),
            forward_timeout: Duration::from_secs(10),
            downstream_insecure_skip_tls_verify: false,
            trust_header: DEFAULT_TRUST_HEADER.to_string(),
            trust_sentinel: DEFAULT_TRUST_SENTINEL.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_dir_mode: 0o755,
            log_file_mode: 0o644,
            max_body_bytes: 1_048_576,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            port: parse_number("PORT", defaults.port),

            downstream_url: env::var("DOWNSTREAM_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.downstream_url),

            forward_timeout: Duration::from_millis(parse_number(
                "FORWARD_TIMEOUT_MS",
                defaults.forward_timeout.as_millis() as u64,
            )),

            downstream_insecure_skip_tls_verify: parse_bool(
                "DOWNSTREAM_INSECURE_SKIP_TLS_VERIFY",
                defaults.downstream_insecure_skip_tls_verify,
            ),

            trust_header: non_empty("TRUST_HEADER").unwrap_or(defaults.trust_header),

            trust_sentinel: non_empty("TRUST_SENTINEL").unwrap_or(defaults.trust_sentinel),

            log_file: non_empty("WEBHOOK_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),

            log_dir_mode: parse_mode("WEBHOOK_LOG_DIR_MODE", defaults.log_dir_mode),

            log_file_mode: parse_mode("WEBHOOK_LOG_FILE_MODE", defaults.log_file_mode),

            max_body_bytes: parse_number("MAX_BODY_BYTES", defaults.max_body_bytes),
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn parse_number<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid number, using default");
            default
        }
    }
}

/// Parse a boolean flag such as "true", "0" or "on".
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

/// Parse an octal permission mode like "0755" or "644".
fn parse_mode(name: &str, default: u32) -> u32 {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let digits = raw.trim().trim_start_matches("0o");
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => mode,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid octal mode, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.forward_timeout, Duration::from_secs(10));
        assert!(!config.downstream_insecure_skip_tls_verify);
        assert_eq!(config.trust_header, "X-Client-Verified");
        assert_eq!(config.trust_sentinel, "SUCCESS");
        assert_eq!(config.log_file, PathBuf::from("/var/log/efibank/webhook.log"));
    }

    #[test]
    fn test_parse_number_valid() {
        env::set_var("TEST_RELAY_NUMBER", " 2500 ");
        assert_eq!(parse_number("TEST_RELAY_NUMBER", 10u64), 2500);
        env::remove_var("TEST_RELAY_NUMBER");
    }

    #[test]
    fn test_parse_number_invalid_uses_default() {
        env::set_var("TEST_RELAY_BAD_NUMBER", "ten");
        assert_eq!(parse_number("TEST_RELAY_BAD_NUMBER", 10u16), 10);
        env::remove_var("TEST_RELAY_BAD_NUMBER");
    }

    #[test]
    fn test_parse_bool() {
        env::set_var("TEST_RELAY_BOOL_ON", "Yes");
        env::set_var("TEST_RELAY_BOOL_OFF", "0");
        env::set_var("TEST_RELAY_BOOL_BAD", "maybe");
        assert!(parse_bool("TEST_RELAY_BOOL_ON", false));
        assert!(!parse_bool("TEST_RELAY_BOOL_OFF", true));
        assert!(parse_bool("TEST_RELAY_BOOL_BAD", true));
        assert!(!parse_bool("TEST_RELAY_BOOL_UNSET", false));
        env::remove_var("TEST_RELAY_BOOL_ON");
        env::remove_var("TEST_RELAY_BOOL_OFF");
        env::remove_var("TEST_RELAY_BOOL_BAD");
    }

    #[test]
    fn test_parse_mode() {
        env::set_var("TEST_RELAY_MODE", "0750");
        env::set_var("TEST_RELAY_MODE_BAD", "rwx");
        assert_eq!(parse_mode("TEST_RELAY_MODE", 0o644), 0o750);
        assert_eq!(parse_mode("TEST_RELAY_MODE_BAD", 0o644), 0o644);
        env::remove_var("TEST_RELAY_MODE");
        env::remove_var("TEST_RELAY_MODE_BAD");
    }

    #[test]
    fn test_non_empty_ignores_blank() {
        env::set_var("TEST_RELAY_BLANK", "   ");
        assert_eq!(non_empty("TEST_RELAY_BLANK"), None);
        env::remove_var("TEST_RELAY_BLANK");
    }
}
