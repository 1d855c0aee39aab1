//! Probe request handling.

use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::keys::{canonical_ip, probe_policies};
use super::response::{json_response, ApiError};
use super::RequestContext;
use crate::config::{ProbeGuardConfig, ProbeModules};
use crate::error::{ProbeGuardError, Result};
use crate::prober::Prober;
use crate::ratelimit::{Admission, AdmissionController, Clock, LimiterRegistry};

const FORWARDED_FOR: &str = "x-forwarded-for";
/// Longest DNS name.
const MAX_TARGET_LEN: usize = 253;
/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 4 * 1024;

/// Per-instance state shared by all connections.
pub struct AppState {
    modules: ProbeModules,
    trusted_proxies: Vec<IpAddr>,
    admission: AdmissionController<RequestContext>,
    prober: Arc<dyn Prober>,
}

impl AppState {
    /// Build the rate limiters and wire them to `prober`.
    ///
    /// Fails on invalid or unknown rate limit policies.
    pub fn new(
        config: &ProbeGuardConfig,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut registry = LimiterRegistry::new(clock);
        let bindings = probe_policies()
            .iter()
            .map(|policy| {
                policy.resolve(config.rate_limits.get(policy.config_key()), &mut registry)
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(unknown) = config
            .rate_limits
            .keys()
            .find(|key| registry.get(key).is_none())
        {
            return Err(ProbeGuardError::Config(format!(
                "unknown rate limit policy '{}'",
                unknown
            )));
        }

        info!(policies = bindings.len(), "Rate limiters initialized");

        Ok(Self {
            modules: config.prober.modules.clone(),
            trusted_proxies: config
                .server
                .trusted_proxies
                .iter()
                .copied()
                .map(canonical_ip)
                .collect(),
            admission: AdmissionController::new(bindings, registry.clock()),
            prober,
        })
    }
}

/// The probe flavours exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    XmppServer,
    XmppsServer,
    XmppClient,
    XmppsClient,
}

impl CheckKind {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.strip_prefix("/api/v1/check/")? {
            "xmpp-server" => Some(CheckKind::XmppServer),
            "xmpps-server" => Some(CheckKind::XmppsServer),
            "xmpp-client" => Some(CheckKind::XmppClient),
            "xmpps-client" => Some(CheckKind::XmppsClient),
            _ => None,
        }
    }

    pub fn module(self, modules: &ProbeModules) -> &str {
        match self {
            CheckKind::XmppServer => &modules.xmpp_server,
            CheckKind::XmppsServer => &modules.xmpps_server,
            CheckKind::XmppClient => &modules.xmpp_client,
            CheckKind::XmppsClient => &modules.xmpps_client,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    target: String,
}

/// Handle one HTTP request from `peer`.
pub async fn handle<B>(state: &AppState, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let peer_ip = canonical_ip(peer.ip());
    let request_id = format!("{}@{}", uuid::Uuid::new_v4().simple(), peer_ip);
    let client_addr = client_addr(&state.trusted_proxies, peer_ip, req.headers());

    debug!(
        request_id = %request_id,
        client_addr = %client_addr,
        method = %req.method(),
        path = %req.uri().path(),
        "Processing request"
    );

    match check(state, req, &request_id, client_addr).await {
        Ok(response) => response,
        Err(err) => {
            if err.status.is_server_error() {
                error!(
                    request_id = %request_id,
                    status = err.status.as_u16(),
                    detail = ?err.detail,
                    "Failed to process request"
                );
            }
            err.into_response(&request_id)
        }
    }
}

async fn check<B>(
    state: &AppState,
    req: Request<B>,
    request_id: &str,
    client_addr: IpAddr,
) -> std::result::Result<Response<Full<Bytes>>, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let kind = CheckKind::from_path(req.uri().path()).ok_or_else(ApiError::not_found)?;
    if req.method() != Method::POST {
        return Err(ApiError::method_not_allowed());
    }

    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                ApiError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {} bytes", MAX_BODY_BYTES),
                )
            } else {
                ApiError::bad_request(format!("failed to read request body: {}", e))
            }
        })?
        .to_bytes();
    let request: CheckRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))?;

    let ctx = RequestContext {
        request_id: request_id.to_string(),
        client_addr,
        target: request.target.trim().to_string(),
    };

    let reservation = match state.admission.check(&ctx).await {
        Admission::Admitted(reservation) => reservation,
        Admission::Rejected(rejection) => {
            debug!(
                request_id = %request_id,
                policy = %rejection.policy,
                "Request rate limited"
            );
            return Err(ApiError::too_many_requests());
        }
    };

    validate_target(&ctx.target).map_err(ApiError::bad_request)?;
    let module = kind.module(&state.modules);

    if !reservation.commit() {
        // Preflight passed, but a concurrent request used up the budget.
        debug!(request_id = %request_id, "Request rate limited on commit");
        return Err(ApiError::too_many_requests());
    }

    let mut report = state
        .prober
        .probe(module, &format!("xmpp:{}", ctx.target))
        .await?;
    report.request_id = request_id.to_string();

    info!(
        request_id = %request_id,
        module = module,
        target = %ctx.target,
        success = ?report.success,
        "Probe completed"
    );
    Ok(json_response(StatusCode::OK, &report))
}

/// Resolve the client address, honoring `X-Forwarded-For` from trusted proxies.
pub fn client_addr(trusted_proxies: &[IpAddr], peer: IpAddr, headers: &HeaderMap) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }

    let Some(forwarded) = headers.get(FORWARDED_FOR) else {
        return peer;
    };

    let first = forwarded
        .to_str()
        .ok()
        .and_then(|value| value.split(',').next())
        .map(str::trim);
    match first.and_then(|addr| addr.parse::<IpAddr>().ok()) {
        Some(addr) => canonical_ip(addr),
        None => {
            warn!(peer = %peer, header = ?forwarded, "Ignoring unparseable X-Forwarded-For");
            peer
        }
    }
}

/// Accept only bare domain names.
pub fn validate_target(target: &str) -> std::result::Result<(), String> {
    if target.is_empty() {
        return Err("target must not be empty".to_string());
    }
    if target.len() > MAX_TARGET_LEN {
        return Err("target is too long".to_string());
    }
    let forbidden = |c: char| {
        c.is_whitespace()
            || c.is_control()
            || matches!(c, ':' | '/' | '\\' | '?' | '#' | ';' | '@' | '[' | ']')
    };
    if target.chars().any(forbidden) {
        return Err(format!("invalid target: {}", target));
    }
    Ok(())
}
