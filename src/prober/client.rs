//! HTTP prober client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::metrics::parse_samples;
use super::{ProbeReport, Prober, ProberError};
use crate::config::ProberConfig;
use crate::error::{ProbeGuardError, Result};

/// Talks to one of several prober endpoints over HTTP.
pub struct HttpProber {
    endpoints: Vec<String>,
    client: reqwest::Client,
}

impl HttpProber {
    /// Create a prober client from configuration.
    pub fn new(config: &ProberConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(ProbeGuardError::Config(
                "at least one prober endpoint is required".to_string(),
            ));
        }

        // Probers are reached directly, never through an HTTP proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProbeGuardError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoints: config.endpoints.clone(),
            client,
        })
    }

    fn pick_endpoint(&self) -> &str {
        self.endpoints
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        module: &str,
        target: &str,
    ) -> std::result::Result<ProbeReport, ProberError> {
        let endpoint = self.pick_endpoint();
        debug!(endpoint = endpoint, module = module, target = target, "Calling prober");

        let started = Instant::now();
        let response = self
            .client
            .get(endpoint)
            .query(&[("module", module), ("target", target)])
            .send()
            .await
            .map_err(|e| {
                warn!(endpoint = endpoint, error = %e, "Prober request failed");
                if e.is_connect() || e.is_timeout() {
                    ProberError::Unavailable(e.to_string())
                } else {
                    ProberError::Malformed(e.to_string())
                }
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            warn!(endpoint = endpoint, status = status.as_u16(), "Prober returned an error");
            return Err(ProberError::BadStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProberError::Unavailable(e.to_string()))?;
        let elapsed = started.elapsed().as_secs_f64();

        let samples = parse_samples(&body)?;
        Ok(ProbeReport::from_samples(elapsed, &samples))
    }
}
