use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder, Response};
use tracing::warn;

/// A simple wrapper on an HTTP client for making provider requests. Sets sensible defaults such
/// as timeouts & user-agent, and classifies failures as transient or permanent.
#[derive(Debug, Clone)]
pub struct Request {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    min_delay: Duration,
    max_delay: Duration,
}

impl Request {
    /// Initializes a new `Request` instance.
    pub(crate) fn new(
        timeout: Duration,
        max_retries: u32,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_retries,
            min_delay,
            max_delay,
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .timeout(self.timeout)
            .header(
                "User-Agent",
                format!("kycverify-core/{}", env!("CARGO_PKG_VERSION")),
            )
    }

    /// Creates a POST request builder with defaults applied.
    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.req(Method::POST, url)
    }

    /// Sends a request once. Retrying is left to the caller.
    pub(crate) async fn execute(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, RequestError> {
        execute_request_builder(request_builder).await
    }

    /// Sends a request built by `req`/`post`, retrying transient failures with exponential
    /// backoff.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<Response, RequestError> {
        let Some(template) = request_builder.try_clone() else {
            return execute_request_builder(request_builder).await;
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize);

        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                RequestError::permanent(
                    "<unknown>".to_string(),
                    None,
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute_request_builder(request_builder).await
        })
        .retry(backoff)
        .when(RequestError::is_retryable)
        .notify(|err: &RequestError, delay: Duration| {
            warn!(url = %err.url, status = ?err.status, ?delay, "retrying provider request: {}", err.error);
        })
        .await
    }
}

/// A failed provider request, classified for retry purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    /// Request URL.
    pub url: String,
    /// HTTP status, absent for transport failures.
    pub status: Option<u16>,
    /// Error details.
    pub error: String,
    retryable: bool,
}

impl RequestError {
    fn retryable(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: true,
        }
    }

    pub(crate) fn permanent(url: String, status: Option<u16>, error: String) -> Self {
        Self {
            url,
            status,
            error,
            retryable: false,
        }
    }

    /// Whether another attempt may succeed (timeouts, connect errors, 429, 5xx).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

async fn execute_request_builder(
    request_builder: RequestBuilder,
) -> Result<Response, RequestError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        RequestError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            None,
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                let body = resp.text().await.unwrap_or_default();
                return Err(RequestError::retryable(
                    url,
                    Some(status),
                    format!("request error with bad status code {status}: {body}"),
                ));
            }
            Ok(resp)
        }
        Err(err) => {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                return Err(RequestError::retryable(
                    url,
                    None,
                    format!("request timeout/connect error: {err}"),
                ));
            }

            Err(RequestError::permanent(
                url,
                None,
                format!("request failed: {err}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn request(max_retries: u32) -> Request {
        Request::new(
            Duration::from_secs(5),
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_handle_retries_server_errors() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", "/authenticate")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let request = request(2);
        let result = request
            .handle(request.post(&format!("{}/authenticate", server.url())))
            .await;

        failing.assert_async().await;
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status, Some(503));
    }

    #[tokio::test]
    async fn test_client_errors_are_returned_as_responses() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/kyc/pan/verify")
            .with_status(422)
            .with_body(r#"{"message": "invalid pan"}"#)
            .expect(1)
            .create_async()
            .await;

        let request = request(2);
        let response = request
            .handle(request.post(&format!("{}/kyc/pan/verify", server.url())))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status().as_u16(), 422);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/kyc/pan/verify")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let request = request(2);
        let err = request
            .execute(request.post(&format!("{}/kyc/pan/verify", server.url())))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_user_agent_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/authenticate")
            .match_header(
                "user-agent",
                mockito::Matcher::Regex("^kycverify-core/".to_string()),
            )
            .with_status(200)
            .create_async()
            .await;

        let request = request(0);
        request
            .execute(request.post(&format!("{}/authenticate", server.url())))
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
