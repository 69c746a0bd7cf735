//! Shared JSON-over-HTTPS client used by the vendor drivers
//!
//! Reads (`GET`) are retried on transient failures with short fixed spacing.
//! Mutations (`POST`, `DELETE`) are sent exactly once so a lost response
//! never turns into a duplicate instance or key.

use crate::error::{CloudError, Result};
use crate::provider::RetryConfig;
use crate::types::Vendor;
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Per-request timeout for vendor API calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bearer-token JSON API client bound to one vendor base URL
#[derive(Clone)]
pub struct ApiClient {
    vendor: Vendor,
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    read_retry: RetryConfig,
}

impl ApiClient {
    pub fn new(vendor: Vendor, base_url: impl Into<String>) -> Self {
        Self {
            vendor,
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token: None,
            read_retry: RetryConfig::reads(),
        }
    }

    pub fn with_read_retry(mut self, retry: RetryConfig) -> Self {
        self.read_retry = retry;
        self
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .ok_or(CloudError::MissingCredentials(self.vendor))?;

        Ok(self
            .client
            .request(method, self.url(path))
            .bearer_auth(token)
            .timeout(REQUEST_TIMEOUT))
    }

    /// Send a request and turn any non-success status into `ProviderApi`
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|source| CloudError::Http {
            vendor: self.vendor,
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(CloudError::ProviderApi {
            vendor: self.vendor,
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let text = response.text().await.map_err(|source| CloudError::Http {
            vendor: self.vendor,
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| CloudError::UnexpectedResponse {
            vendor: self.vendor,
            message: format!("{}: {}", e, truncate(&text, 200)),
        })
    }

    /// GET with bounded retry on transient failures
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            debug!(vendor = %self.vendor, path, attempt, "GET");
            match self.send(self.request(Method::GET, path)?).await {
                Ok(response) => return self.decode(response).await,
                Err(err) if err.is_transient() && attempt + 1 < self.read_retry.max_attempts => {
                    let delay = self.read_retry.delay_for_attempt(attempt);
                    debug!(vendor = %self.vendor, path, error = %err, ?delay, "Retrying read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single-shot GET that only reports whether the vendor accepted it
    pub async fn probe(&self, path: &str) -> Result<()> {
        debug!(vendor = %self.vendor, path, "GET (probe)");
        self.send(self.request(Method::GET, path)?).await?;
        Ok(())
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(vendor = %self.vendor, path, "POST");
        let response = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        self.decode(response).await
    }

    /// DELETE where a missing resource counts as already deleted
    pub async fn delete(&self, path: &str) -> Result<()> {
        debug!(vendor = %self.vendor, path, "DELETE");
        match self.send(self.request(Method::DELETE, path)?).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                debug!(vendor = %self.vendor, path, "Already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockApi;
    use serde_json::json;

    fn client(api: &MockApi) -> ApiClient {
        let mut client = ApiClient::new(Vendor::DigitalOcean, api.base_url());
        client.set_token("test-token");
        client
    }

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new(Vendor::Hetzner, "https://api.hetzner.cloud/v1/");
        assert_eq!(
            client.url("/servers/1"),
            "https://api.hetzner.cloud/v1/servers/1"
        );
    }

    #[test]
    fn test_missing_token_fails_before_network() {
        let client = ApiClient::new(Vendor::Vultr, "http://127.0.0.1:9");
        let err = tokio_test::block_on(client.get::<serde_json::Value>("account")).unwrap_err();
        assert!(matches!(err, CloudError::MissingCredentials(Vendor::Vultr)));
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let api = MockApi::start().await;
        api.route("GET", "/account", 200, json!({"ok": true}));

        let value: serde_json::Value = client(&api).get("account").await.unwrap();
        assert_eq!(value["ok"], true);

        let requests = api.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer test-token"));
    }

    #[tokio::test]
    async fn test_get_retries_server_errors_three_times() {
        let api = MockApi::start().await;
        api.route("GET", "/sizes", 503, json!({"message": "unavailable"}));

        let err = client(&api)
            .get::<serde_json::Value>("sizes")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(api.requests_to("/sizes").len(), 3);
    }

    #[tokio::test]
    async fn test_get_does_not_retry_client_errors() {
        let api = MockApi::start().await;
        api.route("GET", "/sizes", 401, json!({"message": "unauthorized"}));

        let err = client(&api)
            .get::<serde_json::Value>("sizes")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(api.requests_to("/sizes").len(), 1);
    }

    #[tokio::test]
    async fn test_post_is_never_retried() {
        let api = MockApi::start().await;
        api.route("POST", "/droplets", 500, json!({"message": "boom"}));

        let err = client(&api)
            .post::<_, serde_json::Value>("droplets", &json!({"name": "web-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::ProviderApi { status: 500, .. }));
        assert_eq!(api.requests_to("/droplets").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_treats_not_found_as_success() {
        let api = MockApi::start().await;
        api.route("DELETE", "/droplets/42", 404, json!({"id": "not_found"}));

        client(&api).delete("droplets/42").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_surfaces_other_failures_with_body() {
        let api = MockApi::start().await;
        api.route("DELETE", "/droplets/42", 500, json!({"message": "internal"}));

        let err = client(&api).delete("droplets/42").await.unwrap_err();
        match err {
            CloudError::ProviderApi {
                vendor,
                status,
                body,
            } => {
                assert_eq!(vendor, Vendor::DigitalOcean);
                assert_eq!(status, 500);
                assert!(body.contains("internal"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_unexpected_response() {
        let api = MockApi::start().await;
        api.route_raw("GET", "/account", 200, "<html>maintenance</html>");

        let err = client(&api)
            .get::<serde_json::Value>("account")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::UnexpectedResponse { .. }));
    }
}
