//! Outbound HTTP transport.
//!
//! Thin wrapper over `reqwest` with the two request shapes the providers
//! use: GET with query parameters and POST with an XML body. There is no
//! internal retry; the caller owns retry policy because provider
//! idempotency only holds when the same order/refund id is reused. A
//! timed-out call surfaces as `Transport` and leaves the order pending
//! reconciliation via query.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, Identity};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
}

impl GatewayHttpClient {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Builds a client that presents the given PEM bundle (certificate and
    /// key concatenated) for mutual TLS. An unusable bundle is a
    /// configuration problem, not a transport one.
    pub fn with_client_identity(timeout: Duration, identity_pem: &[u8]) -> GatewayResult<Self> {
        let identity =
            Identity::from_pem(identity_pem).map_err(|e| GatewayError::Configuration {
                message: format!("client certificate bundle is not usable: {}", e),
            })?;
        let client = Client::builder()
            .timeout(timeout)
            .identity(identity)
            .build()
            .map_err(|e| GatewayError::Transport {
                message: format!("failed to initialize mutual-TLS client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// GET with percent-encoded query parameters; returns the raw body.
    pub async fn get_query(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
    ) -> GatewayResult<String> {
        debug!(url, param_count = params.len(), "dispatching GET request");
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                message: format!("provider request failed: {}", e),
            })?;
        Self::read_body(response).await
    }

    /// POST with an XML body; returns the raw response body.
    pub async fn post_xml(&self, url: &str, body: Vec<u8>) -> GatewayResult<String> {
        debug!(url, body_len = body.len(), "dispatching XML POST request");
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                message: format!("provider request failed: {}", e),
            })?;
        Self::read_body(response).await
    }

    async fn read_body(response: reqwest::Response) -> GatewayResult<String> {
        let status = response.status();
        let body = response.text().await.map_err(|e| GatewayError::Transport {
            message: format!("failed to read provider response: {}", e),
        })?;
        if !status.is_success() {
            return Err(GatewayError::Transport {
                message: format!("provider returned HTTP {}", status),
            });
        }
        Ok(body)
    }
}
