//! HTTP client construction and error classification shared by the feed
//! client and the embedding gateways.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;

use credence_core::Error;

pub fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

/// Connection failures and timeouts are retryable.
pub fn classify_send_error(service: &str, err: reqwest::Error) -> Error {
    if err.is_builder() {
        return Error::Configuration(format!("{} request is malformed: {}", service, err));
    }
    Error::Transient(format!("{} request failed: {}", service, err))
}

/// 429 and 5xx are retryable, every other non-success status is not.
pub fn classify_status(service: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("{} API error {}: {}", service, status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::Transient(message)
    } else {
        Error::Collaborator(message)
    }
}
