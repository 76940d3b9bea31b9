use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use parley_core::errors::EnrichError;

pub const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co/models";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque inference function: model name + JSON payload in, JSON out.
/// Implementations carry the latency and failure contract; the
/// coordinator layers timeout, retry and fallback on top.
#[async_trait]
pub trait EnrichmentBackend: Send + Sync {
    async fn infer(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError>;
}

#[async_trait]
impl<T: EnrichmentBackend + ?Sized> EnrichmentBackend for Arc<T> {
    async fn infer(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError> {
        (**self).infer(model, payload).await
    }
}

/// Hosted-inference HTTP backend.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.into(),
            token,
        }
    }

    pub fn with_defaults(token: Option<SecretString>) -> Self {
        Self::new(DEFAULT_BASE_URL, token)
    }
}

#[async_trait]
impl EnrichmentBackend for HttpBackend {
    #[instrument(skip(self, payload), fields(model))]
    async fn infer(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError> {
        let mut req = self.client.post(format!("{}/{}", self.base_url, model));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req
            .json(payload)
            .send()
            .await
            .map_err(|e| EnrichError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EnrichError::from_status(status, body));
        }

        resp.json()
            .await
            .map_err(|e| EnrichError::UnusableResponse(format!("invalid JSON: {e}")))
    }
}
