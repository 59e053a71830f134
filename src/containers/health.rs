use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// Decides whether the control server behind a host port is up.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, control_port: u16) -> bool;
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    ok: bool,
}

/// Probes `GET http://{host}:{port}/health`, expecting `{"ok": true}`.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::with_host("localhost")
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            host: host.into(),
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{}/health", self.host, port)
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_healthy(&self, control_port: u16) -> bool {
        let url = self.url(control_port);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(%url, error = %e, "health probe failed");
                return false;
            }
        };
        if !response.status().is_success() {
            tracing::trace!(%url, status = %response.status(), "health probe not ready");
            return false;
        }
        match response.json::<HealthBody>().await {
            Ok(body) => body.ok,
            Err(e) => {
                tracing::trace!(%url, error = %e, "health body unreadable");
                false
            }
        }
    }
}
