//! JSON probe report built from prober samples.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::Serialize;

use super::metrics::Sample;

/// Result of one probe, as returned to API clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Filled in by the API layer
    pub request_id: String,
    pub success: Option<bool>,
    /// Per-phase durations in seconds
    pub durations: BTreeMap<String, f64>,
    /// Wall time of the prober round trip in seconds
    pub total_duration: f64,
    pub certificate_expiration: Option<String>,
    pub auth_info: AuthInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthInfo {
    pub dialback_offered: bool,
    pub sasl_mechanisms: Vec<String>,
}

impl ProbeReport {
    /// Fold prober samples into a report. Unknown metrics are ignored.
    pub fn from_samples(total_duration: f64, samples: &[Sample]) -> Self {
        let mut report = ProbeReport {
            total_duration,
            ..Default::default()
        };

        for sample in samples {
            match sample.name.as_str() {
                "probe_success" => report.success = Some(sample.value > 0.5),
                "probe_xmpp_duration_seconds" => {
                    if let Some(phase) = sample.label("phase") {
                        report.durations.insert(phase.to_string(), sample.value);
                    }
                }
                "probe_ssl_earliest_cert_expiry" => {
                    report.certificate_expiration = format_expiry(sample.value);
                }
                "probe_dialback_offered" => {
                    report.auth_info.dialback_offered = sample.value > 0.5;
                }
                "probe_sasl_mechanism_offered" => {
                    if let Some(mechanism) = sample.label("mechanism") {
                        if sample.value > 0.5 {
                            report.auth_info.sasl_mechanisms.push(mechanism.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        report
    }
}

fn format_expiry(epoch_secs: f64) -> Option<String> {
    if !epoch_secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp(epoch_secs.trunc() as i64, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}
