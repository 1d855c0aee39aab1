//! Client side of the external prober service.
//!
//! The prober runs the actual endpoint checks and answers with metrics text,
//! which is folded into a [`ProbeReport`].

mod client;
mod metrics;
mod report;

use async_trait::async_trait;
use thiserror::Error;

pub use client::HttpProber;
pub use metrics::{parse_samples, Sample};
pub use report::{AuthInfo, ProbeReport};

/// Errors that can occur while talking to the prober.
#[derive(Debug, Error)]
pub enum ProberError {
    #[error("prober unavailable: {0}")]
    Unavailable(String),
    #[error("prober returned status {0}")]
    BadStatus(u16),
    #[error("malformed prober response: {0}")]
    Malformed(String),
}

/// Runs a probe module against a target.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, module: &str, target: &str) -> Result<ProbeReport, ProberError>;
}
