//! Readiness probes

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Why a single probe attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// A single readiness check against a URL
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Succeeds on a 2xx-equivalent response
    async fn probe(&self, url: &str) -> Result<(), ProbeError>;
}

/// HTTP GET probe
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .header("user-agent", "release-pipeline/0.1")
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, %url, "health probe request failed");
                ProbeError::Connection(e.to_string())
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            debug!(status = %response.status(), %url, "health probe non-2xx");
            Err(ProbeError::Status(response.status().as_u16()))
        }
    }
}
