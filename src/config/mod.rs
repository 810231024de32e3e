//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a value is present but invalid.

use std::time::Duration;

use reqwest::header::HeaderName;

use crate::error::{Error, Result};

/// Header carrying the correlation id on outbound requests.
pub const DEFAULT_CORRELATION_HEADER: &str = "CorrelationId";

#[derive(Debug, Clone)]
pub struct Config {
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Number of concurrent worker loops in the job server.
    pub workers: usize,
    /// How often idle workers re-check the queue without a wake-up.
    pub poll_interval: Duration,
    /// Header name stamped on outbound HTTP requests.
    pub correlation_header: HeaderName,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let workers = parsed_var("CORRELATE_WORKERS", 4usize)?;
        if workers == 0 {
            return Err(Error::Config(
                "CORRELATE_WORKERS must be at least 1".to_string(),
            ));
        }

        let header = std::env::var("CORRELATE_HTTP_HEADER")
            .unwrap_or_else(|_| DEFAULT_CORRELATION_HEADER.to_string());
        let correlation_header = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
            Error::Config(format!("CORRELATE_HTTP_HEADER '{header}' is not a valid header name: {e}"))
        })?;

        Ok(Self {
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workers,
            poll_interval: Duration::from_millis(parsed_var("CORRELATE_POLL_INTERVAL_MS", 1000u64)?),
            correlation_header,
        })
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid value '{raw}' for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
