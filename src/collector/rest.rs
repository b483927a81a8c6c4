//! REST protocol client.
//!
//! Speaks plain JSON-over-HTTPS to the target: `fetch` issues
//! `GET https://{addr}/{query}` with basic auth and returns the parsed
//! body. Query paths come straight from the object templates.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::PollerError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connectivity probe issued by `connect`.
const PROBE_QUERY: &str = "api/cluster?fields=version";

pub struct RestClient {
    base: String,
    username: Option<String>,
    password: Option<String>,
    client: Client,
}

impl RestClient {
    pub fn new(
        addr: &str,
        username: Option<String>,
        password: Option<String>,
        insecure_tls: bool,
    ) -> Result<Self, PollerError> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| PollerError::Config(format!("rest client: {e}")))?;
        let base = if addr.contains("://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", addr.trim_end_matches('/'))
        };
        Ok(Self {
            base,
            username,
            password,
            client,
        })
    }

    fn url(&self, query: &str) -> String {
        format!("{}/{}", self.base, query.trim_start_matches('/'))
    }

    async fn get(&self, query: &str, cancel: &CancellationToken) -> Result<Value, PollerError> {
        let url = self.url(query);
        let mut request = self.client.get(&url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PollerError::Cancelled),
            result = request.send() => result.map_err(|e| {
                PollerError::Connection(format!("GET {url}: {e}"))
            })?,
        };

        match response.status() {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PollerError::AuthFailure(format!(
                    "GET {url}: {}",
                    response.status()
                )));
            }
            status => {
                return Err(PollerError::ProtocolResponse(format!("GET {url}: {status}")));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(PollerError::Cancelled),
            body = response.json::<Value>() => body.map_err(|e| {
                PollerError::ProtocolResponse(format!("GET {url}: bad body: {e}"))
            }),
        }
    }
}

#[async_trait::async_trait]
impl super::ProtocolClient for RestClient {
    fn name(&self) -> &str {
        "Rest"
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), PollerError> {
        let info = self.get(PROBE_QUERY, cancel).await?;
        tracing::debug!(
            target_version = %info
                .pointer("/version/full")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown"),
            "rest session established"
        );
        Ok(())
    }

    async fn fetch(
        &mut self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, PollerError> {
        self.get(query, cancel).await
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = RestClient::new("10.0.0.1", None, None, false).unwrap();
        assert_eq!(
            client.url("api/storage/volumes"),
            "https://10.0.0.1/api/storage/volumes"
        );
        assert_eq!(client.url("/api/cluster"), "https://10.0.0.1/api/cluster");

        let explicit = RestClient::new("http://10.0.0.1:8080/", None, None, false).unwrap();
        assert_eq!(explicit.url("api/cluster"), "http://10.0.0.1:8080/api/cluster");
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let mut client = RestClient::new("10.255.255.1", None, None, false).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = super::super::ProtocolClient::fetch(&mut client, "api/cluster", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PollerError::Cancelled));
    }
}
