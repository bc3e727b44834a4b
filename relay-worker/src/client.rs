use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::{header, Client};

use crate::error::ConfigurationError;
use crate::resolver::Endpoint;

/// Failed responses are kept in logs up to this many bytes.
pub const MAX_RESPONSE_BODY: usize = 4 * 1024;

/// The result of a single delivery attempt. Requests never fail any other way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Try the same payload again later.
    RetryableFailure {
        status: Option<StatusCode>,
        retry_after: Option<time::Duration>,
        reason: String,
    },
    /// The webhook URL no longer exists and should be resolved again.
    EndpointInvalid,
    /// The payload can never be delivered.
    PermanentFailure(String),
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::RetryableFailure { .. } => "retryable_failure",
            DeliveryOutcome::EndpointInvalid => "endpoint_invalid",
            DeliveryOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// POST `payload` to `endpoint` and classify the response.
    async fn send(&self, endpoint: &Endpoint, payload: &str) -> DeliveryOutcome;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub request_timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_idle_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: time::Duration::from_secs(5),
            connect_timeout: time::Duration::from_secs(5),
            pool_idle_timeout: time::Duration::from_secs(1),
            pool_max_idle_per_host: 8,
        }
    }
}

pub fn build_http_client(settings: &ClientSettings) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(concat!("webhook-relay/", env!("CARGO_PKG_VERSION")))
        .timeout(settings.request_timeout)
        .connect_timeout(settings.connect_timeout)
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .build()
}

/// A `DeliveryClient` backed by a pooled reqwest client.
#[derive(Clone)]
pub struct HttpDeliveryClient {
    client: Client,
}

impl HttpDeliveryClient {
    pub fn new(settings: &ClientSettings) -> Result<Self, ConfigurationError> {
        Ok(Self {
            client: build_http_client(settings)?,
        })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send(&self, endpoint: &Endpoint, payload: &str) -> DeliveryOutcome {
        let response = match self
            .client
            .post(endpoint.url.clone())
            .body(payload.to_owned())
            .send()
            .await
        {
            Ok(response) => response,
            // URLs carry credentials and must not end up in the reason.
            Err(error) if error.is_builder() => {
                return DeliveryOutcome::PermanentFailure(error.without_url().to_string())
            }
            Err(error) => {
                return DeliveryOutcome::RetryableFailure {
                    status: None,
                    retry_after: None,
                    reason: error.without_url().to_string(),
                }
            }
        };

        let status = response.status();
        match status {
            StatusCode::OK => DeliveryOutcome::Success,
            StatusCode::NOT_FOUND => DeliveryOutcome::EndpointInvalid,
            _ => {
                let retry_after = parse_retry_after_header(response.headers());
                let body = first_n_bytes_of_response(response, MAX_RESPONSE_BODY)
                    .await
                    .unwrap_or_else(|error| format!("<failed to read body: {}>", error.without_url()));

                DeliveryOutcome::RetryableFailure {
                    status: Some(status),
                    retry_after,
                    reason: format!("webhook responded with {}: {}", status, body),
                }
            }
        }
    }
}

/// Read at most `n` bytes of the response body, stopping early once enough has arrived.
pub async fn first_n_bytes_of_response(
    mut response: reqwest::Response,
    n: usize,
) -> reqwest::Result<String> {
    let mut buffer = Vec::with_capacity(n);

    while buffer.len() < n {
        match response.chunk().await? {
            Some(chunk) => {
                let upper_bound = std::cmp::min(n - buffer.len(), chunk.len());
                buffer.extend_from_slice(&chunk[..upper_bound]);
            }
            None => break,
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use relay_common::webhook::MessageOverrides;

    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        Endpoint::parse(url, MessageOverrides::default()).expect("invalid test url")
    }

    fn client() -> HttpDeliveryClient {
        HttpDeliveryClient::new(&ClientSettings {
            request_timeout: time::Duration::from_millis(500),
            ..Default::default()
        })
        .expect("failed to build client")
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, time::Duration::from_secs(120));

        headers.remove(header::RETRY_AFTER);

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);
    }

    #[tokio::test]
    async fn test_ok_is_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/services/T0/B0/secret")
                    .header("content-type", "application/json")
                    .body(r#"{"text":"hi"}"#);
                then.status(200).body("ok");
            })
            .await;

        let outcome = client()
            .send(
                &endpoint(&server.url("/services/T0/B0/secret")),
                r#"{"text":"hi"}"#,
            )
            .await;

        assert_eq!(outcome, DeliveryOutcome::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_not_found_is_endpoint_invalid() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/gone");
                then.status(404).body("no_service");
            })
            .await;

        let outcome = client().send(&endpoint(&server.url("/gone")), "{}").await;

        assert_eq!(outcome, DeliveryOutcome::EndpointInvalid);
    }

    #[tokio::test]
    async fn test_error_status_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500).body("x".repeat(MAX_RESPONSE_BODY * 2));
            })
            .await;

        let outcome = client().send(&endpoint(&server.url("/hook")), "{}").await;

        match outcome {
            DeliveryOutcome::RetryableFailure {
                status,
                retry_after,
                reason,
            } => {
                assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
                assert_eq!(retry_after, None);
                assert!(reason.len() < MAX_RESPONSE_BODY + 100);
                assert!(reason.ends_with("xxx"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_carries_retry_after() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(429).header("Retry-After", "3");
            })
            .await;

        let outcome = client().send(&endpoint(&server.url("/hook")), "{}").await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::RetryableFailure {
                status: Some(StatusCode::TOO_MANY_REQUESTS),
                retry_after: Some(duration),
                ..
            } if duration == time::Duration::from_secs(3)
        ));
    }

    #[tokio::test]
    async fn test_other_client_errors_are_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(400).body("invalid_payload");
            })
            .await;

        let outcome = client().send(&endpoint(&server.url("/hook")), "{}").await;

        assert_eq!(outcome.label(), "retryable_failure");
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/slow");
                then.status(200).delay(time::Duration::from_secs(2));
            })
            .await;

        let outcome = client().send(&endpoint(&server.url("/slow")), "{}").await;

        assert!(matches!(
            outcome,
            DeliveryOutcome::RetryableFailure { status: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_hides_url() {
        let outcome = client()
            .send(&endpoint("http://127.0.0.1:1/services/secret-token"), "{}")
            .await;

        match outcome {
            DeliveryOutcome::RetryableFailure { status, reason, .. } => {
                assert_eq!(status, None);
                assert!(!reason.contains("secret-token"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
